//! The machine table: one row per provisioned or desired instance.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ParseError, View};

/// The role a machine plays in the cluster.
///
/// `role` on a row is authoritative: it is what the minion reports over
/// the management channel. `desired_role` is what the blueprint asked
/// for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[default]
    None,
    Master,
    Worker,
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Role, ParseError> {
        match s {
            "None" => Ok(Role::None),
            "Master" => Ok(Role::Master),
            "Worker" => Ok(Role::Worker),
            _ => Err(ParseError {
                kind: "role",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::None => "None",
            Role::Master => "Master",
            Role::Worker => "Worker",
        };
        write!(f, "{}", s)
    }
}

/// A supported cloud provider.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ProviderName {
    #[default]
    Amazon,
    Google,
    DigitalOcean,
    Vagrant,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [
        ProviderName::Amazon,
        ProviderName::Google,
        ProviderName::DigitalOcean,
        ProviderName::Vagrant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Amazon => "Amazon",
            ProviderName::Google => "Google",
            ProviderName::DigitalOcean => "DigitalOcean",
            ProviderName::Vagrant => "Vagrant",
        }
    }
}

impl FromStr for ProviderName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<ProviderName, ParseError> {
        match s {
            "Amazon" => Ok(ProviderName::Amazon),
            "Google" => Ok(ProviderName::Google),
            "DigitalOcean" => Ok(ProviderName::DigitalOcean),
            "Vagrant" => Ok(ProviderName::Vagrant),
            _ => Err(ParseError {
                kind: "provider",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A machine's connection status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// No status reported yet.
    #[default]
    #[serde(rename = "")]
    Unset,

    /// The cloud provider is booting the machine.
    #[serde(rename = "booting")]
    Booting,

    /// The machine is up, but the foreman has not connected yet.
    #[serde(rename = "connecting")]
    Connecting,

    /// The foreman holds a live management channel to the minion.
    #[serde(rename = "connected")]
    Connected,

    /// The channel dropped; the foreman is dialing again.
    #[serde(rename = "reconnecting")]
    Reconnecting,

    /// The machine is being terminated. The foreman skips it.
    #[serde(rename = "stopping")]
    Stopping,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unset => "",
            Status::Booting => "booting",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Reconnecting => "reconnecting",
            Status::Stopping => "stopping",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One provisioned or desired cloud instance.
///
/// A row with an empty `cloud_id` is desired but not yet acknowledged by
/// the provider. Status transitions are owned by the foreman (and by the
/// reconciler for `Booting`/`Stopping`); no other component writes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u64,

    /// Role the minion actually reports.
    pub role: Role,

    /// Role the blueprint asked for.
    pub desired_role: Role,

    pub provider: ProviderName,
    pub region: String,
    pub size: String,

    /// Disk size in GB. Zero means unspecified.
    pub disk_size: u32,
    pub ssh_keys: Vec<String>,
    pub floating_ip: String,
    pub preemptible: bool,

    /// The provider's opaque instance identifier. Empty until the
    /// provider has acknowledged the boot.
    pub cloud_id: String,
    pub public_ip: String,
    pub private_ip: String,

    pub status: Status,

    /// When `status` last actually changed.
    pub status_time: DateTime<Utc>,
}

impl Default for Machine {
    fn default() -> Machine {
        Machine {
            id: 0,
            role: Role::None,
            desired_role: Role::None,
            provider: ProviderName::default(),
            region: String::new(),
            size: String::new(),
            disk_size: 0,
            ssh_keys: Vec::new(),
            floating_ip: String::new(),
            preemptible: false,
            cloud_id: String::new(),
            public_ip: String::new(),
            private_ip: String::new(),
            status: Status::Unset,
            status_time: DateTime::UNIX_EPOCH,
        }
    }
}

impl Machine {
    /// Update `status`, touching `status_time` only on a real change.
    pub fn set_status(&mut self, status: Status, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.status_time = now;
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags = Vec::new();

        if !self.cloud_id.is_empty() {
            tags.push(self.cloud_id.clone());
        }
        if self.role != Role::None {
            tags.push(self.role.to_string());
        }
        if self.role != self.desired_role {
            tags.push(format!("{}*", self.desired_role));
        }

        let mut attrs = vec![self.provider.to_string(), self.region.clone(), self.size.clone()];
        if self.preemptible {
            attrs.push("preemptible".into());
        }
        tags.push(attrs.join(" "));

        if !self.public_ip.is_empty() {
            tags.push(format!("PublicIP={}", self.public_ip));
        }
        if !self.private_ip.is_empty() {
            tags.push(format!("PrivateIP={}", self.private_ip));
        }
        if !self.floating_ip.is_empty() {
            tags.push(format!("FloatingIP={}", self.floating_ip));
        }
        if self.disk_size != 0 {
            tags.push(format!("Disk={}GB", self.disk_size));
        }
        if self.status != Status::Unset {
            tags.push(self.status.to_string());
        }

        write!(f, "Machine-{}{{{}}}", self.id, tags.join(", "))
    }
}

impl_table_row!(Machine, Machine);

/// Machines in presentation order: masters first, acknowledged instances
/// ahead of pending boots, then by row ID.
pub fn sort_machines(mut machines: Vec<Machine>) -> Vec<Machine> {
    machines.sort_by(|l, r| {
        if l.role != r.role {
            return if l.role == Role::Master || r.role == Role::None {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        if l.cloud_id != r.cloud_id {
            return r.cloud_id.cmp(&l.cloud_id);
        }
        l.id.cmp(&r.id)
    });
    machines
}

impl View<'_> {
    /// The machine with the given public IP, if exactly one exists.
    pub fn get_machine_by_ip(&self, ip: &str) -> Option<Machine> {
        let mut machines = self.select_from::<Machine>(|m| m.public_ip == ip);
        if machines.len() == 1 {
            machines.pop()
        } else {
            None
        }
    }
}
