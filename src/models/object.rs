//! Physical objects of the backend network and their interpretation as
//! versions of a logical key.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Attribute carrying the logical key of a physical object.
pub const ATTR_FILE_NAME: &str = "FileName";
/// Wall-clock creation time in unix seconds, written by the gateway.
pub const ATTR_TIMESTAMP: &str = "Timestamp";
pub const ATTR_CONTENT_TYPE: &str = "Content-Type";
/// Marks gateway-internal objects (settings, notification config, CORS).
pub const ATTR_SYSTEM_NAME: &str = "S3-System-name";
pub const ATTR_VERSIONS_IGNORE: &str = "S3-Versions-ignore";

const SYSTEM_HEADER_PREFIX: &str = "S3-";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid identifier `{0}`")]
pub struct ParseIdError(pub String);

/// Backend-assigned identifier of a physical object. Doubles as the S3
/// version id of the logical key it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ObjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

/// Identifier of a backend container. Every bucket maps to exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(Uuid);

impl ContainerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ContainerId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

/// Full address of a physical object: the unit the backend reads and deletes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAddress {
    pub container: ContainerId,
    pub object: ObjectId,
}

impl ObjectAddress {
    pub fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.object)
    }
}

/// Inclusive byte range of a payload read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Header of a physical object as returned by a backend head call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub address: ObjectAddress,
    pub owner: Option<String>,
    pub payload_size: u64,
    /// Ordering token assigned by the backend. Not a wall clock.
    pub creation_epoch: u64,
    /// Hex-encoded md5 of the payload.
    pub payload_checksum: String,
    pub attributes: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// One physical object interpreted as one version of a logical key.
///
/// Never mutated once built: newer writes supersede it through the
/// version-control headers, see [`crate::services::versions`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub container: ContainerId,
    pub owner: Option<String>,
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub creation_epoch: u64,
    /// Every attribute except the file name and timestamp, version-control
    /// headers included.
    pub headers: BTreeMap<String, String>,
    pub content_type: String,
    pub hash_sum: String,
    /// Synthetic common-prefix entry produced by delimiter listing.
    pub is_dir: bool,
}

impl ObjectInfo {
    /// Interpret a backend header. Returns `None` for objects without a
    /// logical key, which are never part of a bucket's namespace.
    pub fn from_meta(bucket: &str, meta: &ObjectMeta) -> Option<Self> {
        let name = meta.attribute(ATTR_FILE_NAME)?.to_string();
        let created = meta
            .attribute(ATTR_TIMESTAMP)
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let headers: BTreeMap<String, String> = meta
            .attributes
            .iter()
            .filter(|(k, _)| k.as_str() != ATTR_FILE_NAME && k.as_str() != ATTR_TIMESTAMP)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            id: meta.address.object,
            container: meta.address.container,
            owner: meta.owner.clone(),
            bucket: bucket.to_string(),
            name,
            size: meta.payload_size,
            created,
            creation_epoch: meta.creation_epoch,
            content_type: headers.get(ATTR_CONTENT_TYPE).cloned().unwrap_or_default(),
            headers,
            hash_sum: meta.payload_checksum.clone(),
            is_dir: false,
        })
    }

    /// Version id as surfaced to callers.
    pub fn version(&self) -> String {
        self.id.to_string()
    }

    pub fn address(&self) -> ObjectAddress {
        ObjectAddress::new(self.container, self.id)
    }

    /// Name-cache key: `bucket/key`.
    pub fn nice_name(&self) -> String {
        format!("{}/{}", self.bucket, self.name)
    }

    pub fn is_system(&self) -> bool {
        self.headers
            .get(ATTR_SYSTEM_NAME)
            .is_some_and(|v| !v.is_empty())
            || self
                .headers
                .get(ATTR_VERSIONS_IGNORE)
                .is_some_and(|v| !v.is_empty())
    }

    /// Headers that belong to the user, with gateway bookkeeping stripped.
    pub fn user_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(k, _)| !is_system_header(k) && k.as_str() != ATTR_CONTENT_TYPE)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Turn this entry into a common-prefix placeholder named `prefix`.
    pub fn into_dir(mut self, prefix: String) -> Self {
        self.name = prefix;
        self.is_dir = true;
        self.size = 0;
        self.headers.clear();
        self.content_type.clear();
        self.hash_sum.clear();
        self
    }
}

pub fn is_system_header(key: &str) -> bool {
    key.starts_with(SYSTEM_HEADER_PREFIX)
}
