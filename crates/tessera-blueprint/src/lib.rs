//! The parsed cluster blueprint and its JSON wire format.
//!
//! A blueprint is the user's declarative description of the cluster:
//! which machines to run where, which containers to place on them, how
//! they may talk to each other, and who may reach the control plane. A
//! separate language front-end produces the JSON; this crate owns the
//! deserialized form, the vet-time invariant checks, and the
//! deterministic content IDs the wire format carries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod hash;
mod vet;

pub use hash::{canonical_string, content_id};

/// The reserved hostname denoting the public internet in connections.
pub const PUBLIC_INTERNET: &str = "public";

/// Errors raised while parsing or vetting a blueprint.
///
/// All of these surface before the blueprint is accepted; a failed
/// deploy leaves the datastore untouched.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("invalid blueprint: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("hostname \"{0}\" used by multiple containers")]
    DuplicateHostname(String),

    #[error("image \"{0}\" has differing Dockerfiles")]
    ConflictingDockerfile(String),

    #[error("floating IP {0} assigned to multiple machines")]
    FloatingIpReuse(String),

    #[error("connection references undeployed hostname \"{0}\"")]
    UndeployedHostname(String),

    #[error("connection from \"{from}\" to \"{to}\" has invalid port range {min_port}-{max_port}")]
    InvalidPortRange {
        from: String,
        to: String,
        min_port: u16,
        max_port: u16,
    },
}

/// A parsed blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Blueprint {
    pub machines: Vec<Machine>,
    pub containers: Vec<Container>,
    pub labels: Vec<Label>,
    pub connections: Vec<Connection>,
    pub placements: Vec<Placement>,
    pub namespace: String,
    #[serde(rename = "adminACL")]
    pub admin_acl: Vec<String>,
    pub max_price: f64,
}

impl Blueprint {
    /// Parse and vet a blueprint from its JSON wire form.
    pub fn from_json(text: &str) -> Result<Blueprint, BlueprintError> {
        let blueprint: Blueprint = serde_json::from_str(text)?;
        blueprint.vet()?;
        Ok(blueprint)
    }

    /// Serialize back to the JSON wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An inclusive range constraint on a machine resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    /// Whether `value` satisfies this range. A zero max is unbounded.
    pub fn accepts(&self, value: f64) -> bool {
        value >= self.min && (self.max == 0.0 || value <= self.max)
    }
}

/// A desired machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Machine {
    pub provider: String,
    pub role: String,
    pub region: String,
    pub size: String,
    pub disk_size: u32,
    pub cpu: Range,
    pub ram: Range,
    pub preemptible: bool,
    pub floating_ip: String,
    pub ssh_keys: Vec<String>,
}

/// A desired container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    /// Deterministic content-hash ID assigned by the front-end.
    pub id: String,
    pub image: Image,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    pub hostname: String,
}

impl Container {
    /// Recompute this container's deterministic content ID.
    ///
    /// The ID is a pure function of the container's attributes plus a
    /// per-reference disambiguator, so attribute-equal blueprints
    /// produce identical IDs across runs.
    pub fn content_id(&self, ref_id: u32) -> String {
        let attrs = serde_json::json!({
            "image": self.image,
            "command": self.command,
            "env": self.env,
            "filepathToContent": self.filepath_to_content,
            "hostname": self.hostname,
        });
        hash::content_id(&attrs, ref_id)
    }
}

/// A container image: a registry name plus an optional inline Dockerfile
/// for images the cluster builds itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub name: String,
    pub dockerfile: String,
}

/// A named group of container IDs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Label {
    pub name: String,
    pub ids: Vec<String>,
}

/// An allowed network path between two hostnames, or between a hostname
/// and [`PUBLIC_INTERNET`]. Ports are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// A placement constraint restricting where a container may run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Placement {
    /// Hostname of the container the constraint applies to.
    pub target_container: String,

    /// When set, `target_container` must not share a machine with
    /// `other_container`.
    pub exclusive: bool,
    pub other_container: String,

    /// Machine attribute constraints. Empty fields do not constrain.
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_format() {
        let text = r#"{
            "machines": [
                {"provider": "Amazon", "role": "Worker", "region": "us-west-1",
                 "size": "m3.medium", "sshKeys": ["ssh-rsa aaa"]}
            ],
            "containers": [
                {"id": "abc123", "image": {"name": "alpine"},
                 "command": ["tail", "-f", "/dev/null"], "hostname": "web"}
            ],
            "labels": [{"name": "web", "ids": ["abc123"]}],
            "connections": [{"from": "public", "to": "web", "minPort": 80, "maxPort": 80}],
            "placements": [],
            "namespace": "prod",
            "adminACL": ["1.2.3.4/32"],
            "maxPrice": 0.5
        }"#;

        let bp = Blueprint::from_json(text).unwrap();
        assert_eq!(bp.namespace, "prod");
        assert_eq!(bp.machines.len(), 1);
        assert_eq!(bp.machines[0].ssh_keys, vec!["ssh-rsa aaa"]);
        assert_eq!(bp.containers[0].image.name, "alpine");
        assert_eq!(bp.connections[0].from, PUBLIC_INTERNET);
        assert_eq!(bp.admin_acl, vec!["1.2.3.4/32"]);
        assert_eq!(bp.max_price, 0.5);
    }

    #[test]
    fn test_missing_fields_default() {
        let bp = Blueprint::from_json(r#"{"namespace": "x"}"#).unwrap();
        assert!(bp.machines.is_empty());
        assert!(bp.containers.is_empty());
        assert_eq!(bp.max_price, 0.0);
    }

    #[test]
    fn test_round_trip() {
        let mut bp = Blueprint {
            namespace: "ns".into(),
            ..Default::default()
        };
        bp.connections.push(Connection {
            from: "a".into(),
            to: "b".into(),
            min_port: 80,
            max_port: 80,
        });
        bp.containers.push(Container {
            id: "1".into(),
            image: Image {
                name: "alpine".into(),
                dockerfile: String::new(),
            },
            hostname: "a".into(),
            ..Default::default()
        });
        bp.containers.push(Container {
            id: "2".into(),
            image: Image {
                name: "alpine".into(),
                dockerfile: String::new(),
            },
            hostname: "b".into(),
            ..Default::default()
        });

        let parsed = Blueprint::from_json(&bp.to_json()).unwrap();
        assert_eq!(parsed, bp);
    }

    #[test]
    fn test_range_accepts() {
        let r = Range { min: 1.0, max: 0.0 };
        assert!(r.accepts(1.0));
        assert!(r.accepts(100.0));
        assert!(!r.accepts(0.5));

        let bounded = Range { min: 2.0, max: 4.0 };
        assert!(bounded.accepts(4.0));
        assert!(!bounded.accepts(4.5));
    }
}
