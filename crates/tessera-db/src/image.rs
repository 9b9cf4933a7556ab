//! The image table: cluster-built images and their resolved digests.

use serde::{Deserialize, Serialize};


pub const IMAGE_BUILDING: &str = "building";
pub const IMAGE_BUILT: &str = "built";

/// A cluster-built image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    pub name: String,
    pub dockerfile: String,

    /// Digest of the built image, once available.
    pub docker_id: String,

    /// [`IMAGE_BUILDING`] or [`IMAGE_BUILT`].
    pub status: String,
}

impl_table_row!(Image, Image);
