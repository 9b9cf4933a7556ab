//! Instance sizing: per-provider size catalogs and defaults.

use std::cmp::Ordering;

use tessera_blueprint::Range;
use tessera_db::ProviderName;

/// Disk size applied when the blueprint leaves it unspecified.
pub const DEFAULT_DISK_SIZE_GB: u32 = 32;

/// One instance type a provider offers. RAM is in GiB, price in USD per
/// hour.
struct Description {
    size: &'static str,
    cpu: f64,
    ram: f64,
    price: f64,
}

static AMAZON: &[Description] = &[
    Description { size: "t2.micro", cpu: 1.0, ram: 1.0, price: 0.0116 },
    Description { size: "t2.small", cpu: 1.0, ram: 2.0, price: 0.023 },
    Description { size: "t2.medium", cpu: 2.0, ram: 4.0, price: 0.0464 },
    Description { size: "m3.medium", cpu: 1.0, ram: 3.75, price: 0.067 },
    Description { size: "m4.large", cpu: 2.0, ram: 8.0, price: 0.1 },
    Description { size: "c4.large", cpu: 2.0, ram: 3.75, price: 0.1 },
    Description { size: "c4.xlarge", cpu: 4.0, ram: 7.5, price: 0.199 },
    Description { size: "m4.xlarge", cpu: 4.0, ram: 16.0, price: 0.2 },
    Description { size: "m4.2xlarge", cpu: 8.0, ram: 32.0, price: 0.4 },
];

static GOOGLE: &[Description] = &[
    Description { size: "g1-small", cpu: 1.0, ram: 1.7, price: 0.027 },
    Description { size: "n1-standard-1", cpu: 1.0, ram: 3.75, price: 0.0475 },
    Description { size: "n1-standard-2", cpu: 2.0, ram: 7.5, price: 0.095 },
    Description { size: "n1-standard-4", cpu: 4.0, ram: 15.0, price: 0.19 },
];

static DIGITAL_OCEAN: &[Description] = &[
    Description { size: "512mb", cpu: 1.0, ram: 0.5, price: 0.00744 },
    Description { size: "1gb", cpu: 1.0, ram: 1.0, price: 0.01488 },
    Description { size: "2gb", cpu: 2.0, ram: 2.0, price: 0.02976 },
    Description { size: "4gb", cpu: 2.0, ram: 4.0, price: 0.05952 },
];

/// The region used when the blueprint does not pick one.
pub fn default_region(provider: ProviderName) -> &'static str {
    match provider {
        ProviderName::Amazon => "us-west-1",
        ProviderName::Google => "us-east1-b",
        ProviderName::DigitalOcean => "sfo1",
        ProviderName::Vagrant => "",
    }
}

/// The cheapest size satisfying the RAM/CPU ranges under `max_price`
/// (zero means unconstrained), or empty when nothing fits. Vagrant has
/// no catalog; its size string encodes the resources directly.
pub fn choose_size(provider: ProviderName, ram: Range, cpu: Range, max_price: f64) -> String {
    match provider {
        ProviderName::Amazon => pick(AMAZON, ram, cpu, max_price),
        ProviderName::Google => pick(GOOGLE, ram, cpu, max_price),
        ProviderName::DigitalOcean => pick(DIGITAL_OCEAN, ram, cpu, max_price),
        ProviderName::Vagrant => vagrant_size(ram, cpu),
    }
}

fn pick(descriptions: &[Description], ram: Range, cpu: Range, max_price: f64) -> String {
    descriptions
        .iter()
        .filter(|d| {
            ram.accepts(d.ram) && cpu.accepts(d.cpu) && (max_price == 0.0 || d.price <= max_price)
        })
        .min_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal))
        .map(|d| d.size.to_string())
        .unwrap_or_default()
}

fn vagrant_size(ram: Range, cpu: Range) -> String {
    format!("{},{}", ram.min.max(1.0), cpu.min.max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: f64, max: f64) -> Range {
        Range { min, max }
    }

    #[test]
    fn test_unconstrained_picks_cheapest() {
        assert_eq!(
            choose_size(ProviderName::Amazon, range(0.0, 0.0), range(0.0, 0.0), 0.0),
            "t2.micro"
        );
    }

    #[test]
    fn test_ram_floor_respected() {
        assert_eq!(
            choose_size(ProviderName::Amazon, range(4.0, 0.0), range(0.0, 0.0), 0.0),
            "t2.medium"
        );
    }

    #[test]
    fn test_price_cap_can_exclude_everything() {
        assert_eq!(
            choose_size(ProviderName::Google, range(8.0, 0.0), range(0.0, 0.0), 0.05),
            ""
        );
    }

    #[test]
    fn test_cpu_and_ram_jointly() {
        assert_eq!(
            choose_size(
                ProviderName::DigitalOcean,
                range(2.0, 0.0),
                range(2.0, 0.0),
                0.0
            ),
            "2gb"
        );
    }

    #[test]
    fn test_vagrant_encodes_resources() {
        assert_eq!(
            choose_size(ProviderName::Vagrant, range(2.0, 0.0), range(0.0, 0.0), 0.0),
            "2,1"
        );
    }

    #[test]
    fn test_default_regions() {
        assert_eq!(default_region(ProviderName::Amazon), "us-west-1");
        assert_eq!(default_region(ProviderName::Vagrant), "");
    }
}
