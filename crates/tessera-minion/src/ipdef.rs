//! Deterministic derivations for the cluster network: container
//! addresses, MACs, and interface names.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use sha1::{Digest, Sha1};

/// The cluster subnet, 10.0.0.0/8.
const SUBNET_PREFIX: u32 = 0x0a00_0000;
const HOST_MASK: u32 = 0x00ff_ffff;

/// The gateway every container routes and resolves through.
pub const GATEWAY_IP: &str = "10.0.0.1";

/// Kernel limit on interface name length.
const IF_NAME_MAX: usize = 15;

/// Interface name for a network endpoint.
pub fn if_name(endpoint_id: &str) -> String {
    truncate(format!("tve-{}", endpoint_id))
}

/// The switch-side patch port paired with a container endpoint.
pub fn patch_peer(endpoint_id: &str) -> String {
    truncate(format!("tbr-{}", endpoint_id))
}

fn truncate(mut name: String) -> String {
    name.truncate(IF_NAME_MAX);
    name
}

/// A MAC derived from a container IP, so addresses survive container
/// restarts. Empty for unparseable input.
pub fn ip_to_mac(ip: &str) -> String {
    match ip.parse::<Ipv4Addr>() {
        Ok(addr) => {
            let o = addr.octets();
            format!("02:00:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
        }
        Err(_) => String::new(),
    }
}

/// Deterministically pick an unused address in the cluster subnet: hash
/// the seed for a starting point, then probe linearly past collisions.
/// The network, gateway, and broadcast addresses are never handed out.
pub fn allocate_ip(seed: &str, used: &HashSet<String>) -> Option<String> {
    let mut hasher = Sha1::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let start = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & HOST_MASK;

    for i in 0..=HOST_MASK {
        let host = start.wrapping_add(i) & HOST_MASK;
        if host == 0 || host == HOST_MASK {
            continue;
        }
        let ip = Ipv4Addr::from(SUBNET_PREFIX | host).to_string();
        if ip == GATEWAY_IP || used.contains(&ip) {
            continue;
        }
        return Some(ip);
    }
    None
}
