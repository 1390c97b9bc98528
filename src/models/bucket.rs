//! Represents a logical bucket: a named view over one backend container.

use super::object::ContainerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bucket as resolved from the backend network.
///
/// The gateway never stores buckets itself: the name resolves to a container
/// and every object of the bucket lives in that container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketInfo {
    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Backend container holding the bucket's objects.
    pub container: ContainerId,

    /// Owner recorded on objects written through the gateway.
    pub owner: String,

    /// Region where the bucket is hosted (e.g. "us-west-2").
    pub region: String,

    /// When this bucket was created.
    pub created: DateTime<Utc>,
}

/// Per-bucket settings kept by the settings tree.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketSettings {
    pub versioning_enabled: bool,
}
