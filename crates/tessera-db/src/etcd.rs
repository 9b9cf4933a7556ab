//! The etcd table: a cache of cluster membership, written by the
//! foreman and the minion-side sync; read-only for everyone else.

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Etcd {
    pub id: u64,

    /// Private IPs of the etcd members (the cluster masters).
    pub members: Vec<String>,

    pub leader_ip: String,
}

impl_table_row!(Etcd, Etcd);
