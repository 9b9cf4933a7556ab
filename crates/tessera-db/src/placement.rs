//! The placement table: constraints restricting where containers run.

use serde::{Deserialize, Serialize};

/// A placement constraint. Empty machine-attribute fields do not
/// constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: u64,

    /// Hostname of the container the constraint applies to.
    pub target_container: String,

    /// When set, the target must not share a machine with
    /// `other_container`.
    pub exclusive: bool,
    pub other_container: String,

    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
}

impl_table_row!(Placement, Placement);
