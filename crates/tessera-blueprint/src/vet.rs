//! Vet-time invariant checks.
//!
//! A blueprint is vetted once, before it is accepted by the daemon. A
//! violation fails the deploy with a human-readable message and leaves
//! the datastore untouched; nothing downstream has to re-check these
//! invariants.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Blueprint, BlueprintError, PUBLIC_INTERNET};

impl Blueprint {
    /// Check the blueprint's internal consistency.
    pub fn vet(&self) -> Result<(), BlueprintError> {
        self.vet_hostnames()?;
        self.vet_images()?;
        self.vet_floating_ips()?;
        self.vet_connections()?;
        Ok(())
    }

    /// Hostnames, when set, are globally unique within a deployment.
    fn vet_hostnames(&self) -> Result<(), BlueprintError> {
        let mut seen = BTreeSet::new();
        for c in &self.containers {
            if c.hostname.is_empty() {
                continue;
            }
            if !seen.insert(c.hostname.as_str()) {
                return Err(BlueprintError::DuplicateHostname(c.hostname.clone()));
            }
        }
        Ok(())
    }

    /// Two containers naming the same image must agree on its Dockerfile,
    /// otherwise the image a worker builds would depend on scheduling
    /// order.
    fn vet_images(&self) -> Result<(), BlueprintError> {
        let mut dockerfiles: BTreeMap<&str, &str> = BTreeMap::new();
        for c in &self.containers {
            match dockerfiles.get(c.image.name.as_str()) {
                Some(existing) if *existing != c.image.dockerfile => {
                    return Err(BlueprintError::ConflictingDockerfile(c.image.name.clone()));
                }
                Some(_) => {}
                None => {
                    dockerfiles.insert(&c.image.name, &c.image.dockerfile);
                }
            }
        }
        Ok(())
    }

    /// A floating IP is bound to a single instance at the provider, so
    /// two machines requesting the same one can never both converge.
    fn vet_floating_ips(&self) -> Result<(), BlueprintError> {
        let mut seen = BTreeSet::new();
        for m in &self.machines {
            if m.floating_ip.is_empty() {
                continue;
            }
            if !seen.insert(m.floating_ip.as_str()) {
                return Err(BlueprintError::FloatingIpReuse(m.floating_ip.clone()));
            }
        }
        Ok(())
    }

    /// Connection endpoints must name a deployed hostname, a label, or
    /// the public internet, and port ranges must be ordered.
    fn vet_connections(&self) -> Result<(), BlueprintError> {
        let mut deployed: BTreeSet<&str> = BTreeSet::new();
        deployed.insert(PUBLIC_INTERNET);
        for c in &self.containers {
            if !c.hostname.is_empty() {
                deployed.insert(&c.hostname);
            }
        }
        for l in &self.labels {
            deployed.insert(&l.name);
        }

        for conn in &self.connections {
            for endpoint in [&conn.from, &conn.to] {
                if !deployed.contains(endpoint.as_str()) {
                    return Err(BlueprintError::UndeployedHostname(endpoint.clone()));
                }
            }
            if conn.min_port > conn.max_port {
                return Err(BlueprintError::InvalidPortRange {
                    from: conn.from.clone(),
                    to: conn.to.clone(),
                    min_port: conn.min_port,
                    max_port: conn.max_port,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Blueprint, BlueprintError, Connection, Container, Image, Machine};

    fn container(hostname: &str, image: &str, dockerfile: &str) -> Container {
        Container {
            hostname: hostname.into(),
            image: Image {
                name: image.into(),
                dockerfile: dockerfile.into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_hostname_rejected() {
        let bp = Blueprint {
            containers: vec![container("web", "alpine", ""), container("web", "nginx", "")],
            ..Default::default()
        };
        assert!(matches!(
            bp.vet(),
            Err(BlueprintError::DuplicateHostname(h)) if h == "web"
        ));
    }

    #[test]
    fn test_empty_hostnames_allowed() {
        let bp = Blueprint {
            containers: vec![container("", "alpine", ""), container("", "alpine", "")],
            ..Default::default()
        };
        assert!(bp.vet().is_ok());
    }

    #[test]
    fn test_conflicting_dockerfile_rejected() {
        let bp = Blueprint {
            containers: vec![
                container("a", "custom", "FROM alpine"),
                container("b", "custom", "FROM ubuntu"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            bp.vet(),
            Err(BlueprintError::ConflictingDockerfile(i)) if i == "custom"
        ));
    }

    #[test]
    fn test_floating_ip_reuse_rejected() {
        let machine = |ip: &str| Machine {
            floating_ip: ip.into(),
            ..Default::default()
        };
        let bp = Blueprint {
            machines: vec![machine("9.9.9.9"), machine("9.9.9.9")],
            ..Default::default()
        };
        assert!(matches!(bp.vet(), Err(BlueprintError::FloatingIpReuse(_))));
    }

    #[test]
    fn test_undeployed_endpoint_rejected() {
        let bp = Blueprint {
            containers: vec![container("web", "alpine", "")],
            connections: vec![Connection {
                from: "web".into(),
                to: "db".into(),
                min_port: 5432,
                max_port: 5432,
            }],
            ..Default::default()
        };
        assert!(matches!(
            bp.vet(),
            Err(BlueprintError::UndeployedHostname(h)) if h == "db"
        ));
    }

    #[test]
    fn test_public_endpoint_allowed() {
        let bp = Blueprint {
            containers: vec![container("web", "alpine", "")],
            connections: vec![Connection {
                from: "public".into(),
                to: "web".into(),
                min_port: 80,
                max_port: 80,
            }],
            ..Default::default()
        };
        assert!(bp.vet().is_ok());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let bp = Blueprint {
            containers: vec![container("web", "alpine", "")],
            connections: vec![Connection {
                from: "public".into(),
                to: "web".into(),
                min_port: 90,
                max_port: 80,
            }],
            ..Default::default()
        };
        assert!(matches!(
            bp.vet(),
            Err(BlueprintError::InvalidPortRange { .. })
        ));
    }
}
