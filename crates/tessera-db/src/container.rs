//! The container table: one row per desired container assignment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};


/// A desired container.
///
/// The master scheduler owns `minion` and `ip`; the worker scheduler
/// owns the Docker-reported fields (`docker_id`, `endpoint_id`,
/// `status`, `created`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: u64,

    /// Content-hash ID from the blueprint wire format.
    pub blueprint_id: String,

    pub image: String,

    /// Inline Dockerfile for cluster-built images; empty for registry
    /// images.
    pub dockerfile: String,

    /// Resolved image digest. May be empty until the image is known.
    pub image_id: String,

    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,

    /// Unique within a deployment, or empty.
    pub hostname: String,

    /// Assigned by the master scheduler.
    pub ip: String,

    /// Private IP of the worker this container runs on. Empty means
    /// unassigned.
    pub minion: String,

    pub docker_id: String,
    pub endpoint_id: String,
    pub status: String,
    pub created: Option<DateTime<Utc>>,
}

impl_table_row!(Container, Container);
