//! Backend object network abstraction.
//!
//! The network stores immutable objects addressed by (container, object id).
//! It can search objects by attribute, read their headers and payloads, store
//! new objects and tombstone existing ones. Nothing is ever updated in place.
//!
//! Implementations:
//! - [`memory::MemoryNetwork`]: in-process network for tests and demos
//! - [`local::LocalNetwork`]: SQLite headers plus on-disk payloads

pub mod local;
pub mod memory;

use crate::{
    models::{
        bucket::BucketInfo,
        object::{ByteRange, ContainerId, ObjectAddress, ObjectId, ObjectMeta},
    },
    services::context::RequestContext,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{collections::BTreeMap, io, pin::Pin};
use thiserror::Error;
use tokio::io::AsyncWrite;

/// Payload of an object being written.
pub type PayloadStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Sink receiving the payload of an object being read.
pub type PayloadSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("object `{0}` not found")]
    NotFound(ObjectAddress),
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{0}` already exists")]
    ContainerAlreadyExists(String),
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("range {start}-{end} is outside a payload of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },
    #[error("{0}")]
    Status(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Access rejections arrive as plain status messages.
    pub fn is_access_denied(&self) -> bool {
        let msg = self.to_string();
        msg.contains("access to operation") && msg.contains("is denied by")
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            NetworkError::NotFound(_) | NetworkError::ContainerNotFound(_) => true,
            other => other.to_string().contains("not found"),
        }
    }
}

/// Attribute search over one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchParams {
    pub container: ContainerId,
    /// Attributes that must match exactly.
    pub filters: Vec<(String, String)>,
    /// Common prefix of the file name attribute. Empty matches everything.
    pub prefix: String,
}

/// A new immutable object. The payload is streamed separately.
#[derive(Clone, Debug)]
pub struct PutRequest {
    pub container: ContainerId,
    pub owner: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectNetwork: Send + Sync + 'static {
    /// Resolve a bucket name to its container.
    async fn container(&self, ctx: &RequestContext, name: &str) -> NetworkResult<BucketInfo>;

    async fn create_container(
        &self,
        ctx: &RequestContext,
        name: &str,
        region: &str,
    ) -> NetworkResult<BucketInfo>;

    /// Ids of live objects matching the search.
    async fn search(&self, ctx: &RequestContext, params: &SearchParams)
    -> NetworkResult<Vec<ObjectId>>;

    async fn head(&self, ctx: &RequestContext, address: &ObjectAddress)
    -> NetworkResult<ObjectMeta>;

    /// Stream the payload, optionally restricted to `range`, into `sink`.
    async fn get(
        &self,
        ctx: &RequestContext,
        address: &ObjectAddress,
        range: Option<ByteRange>,
        sink: PayloadSink<'_>,
    ) -> NetworkResult<ObjectMeta>;

    /// Store a new object and return the id the network assigned to it.
    async fn put(
        &self,
        ctx: &RequestContext,
        request: PutRequest,
        payload: PayloadStream,
    ) -> NetworkResult<ObjectId>;

    /// Put a tombstone on the object.
    async fn delete(&self, ctx: &RequestContext, address: &ObjectAddress) -> NetworkResult<()>;

    /// Readiness probe.
    async fn health(&self, ctx: &RequestContext) -> NetworkResult<()>;
}

const CONTAINER_NAME_MIN_LEN: usize = 3;
const CONTAINER_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

/// Validate a bucket name before it becomes a container.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn ensure_container_name_safe(name: &str) -> NetworkResult<()> {
    let invalid = |reason: &str| NetworkError::InvalidContainerName {
        name: name.to_string(),
        reason: reason.into(),
    };

    if name.trim() != name {
        return Err(invalid("cannot begin or end with whitespace"));
    }
    if !(CONTAINER_NAME_MIN_LEN..=CONTAINER_NAME_MAX_LEN).contains(&name.len()) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Normalize a region and check it against the supported set.
pub fn normalize_region(region: &str) -> NetworkResult<String> {
    let normalized = region.to_lowercase();
    if SUPPORTED_REGIONS.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(NetworkError::UnsupportedRegion(region.to_string()))
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

/// Clamp-check a range against a payload size.
pub(crate) fn check_range(range: ByteRange, size: u64) -> NetworkResult<ByteRange> {
    if range.start > range.end || range.start >= size {
        return Err(NetworkError::InvalidRange {
            start: range.start,
            end: range.end,
            size,
        });
    }
    Ok(ByteRange {
        start: range.start,
        end: range.end.min(size - 1),
    })
}
