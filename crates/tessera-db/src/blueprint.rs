//! The blueprint table. Exactly one row exists once a cluster is
//! deployed.

use serde::{Deserialize, Serialize};


/// The deployed blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: u64,

    /// The parsed blueprint as submitted.
    pub spec: tessera_blueprint::Blueprint,

    /// Cluster identity. Replacing it invalidates all machine rows.
    pub namespace: String,

    /// CIDRs permitted to reach the control plane.
    pub admin_acl: Vec<String>,
}

impl_table_row!(Blueprint, Blueprint);
