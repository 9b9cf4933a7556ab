//! The connection table: allowed network paths between hostnames.

use serde::{Deserialize, Serialize};


/// An allowed network path. `from` and `to` are hostnames or the
/// reserved token `public`; ports are inclusive. Connections involving
/// `public` carry a single port (`min_port == max_port`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: u64,
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl_table_row!(Connection, Connection);
