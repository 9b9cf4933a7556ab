//! The minion table: cluster members as seen from a minion, including
//! the local identity row.

use serde::{Deserialize, Serialize};

use crate::Role;

/// One cluster member. The row with `is_self` set describes the local
/// machine and carries the configuration last pushed by the foreman.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Minion {
    pub id: u64,
    pub is_self: bool,
    pub role: Role,
    pub private_ip: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
    pub authorized_keys: Vec<String>,

    /// The blueprint text last pushed over the management channel.
    pub blueprint: String,
}

impl_table_row!(Minion, Minion);
