//! The ACL table: the ingress rules the reconciler derives from the
//! blueprint and pushes to each provider.

use serde::{Deserialize, Serialize};


/// One ingress rule. `cidr_ip` supports the reserved token `local`,
/// which is substituted with the daemon's own public IP (`/32`) at
/// apply time.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Acl {
    pub id: u64,
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl_table_row!(Acl, Acl);
