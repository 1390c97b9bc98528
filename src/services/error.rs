//! Errors surfaced by the gateway layer to the protocol-facing side.

use crate::{network::NetworkError, services::settings::SettingsError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("bucket `{0}` not found")]
    NoSuchBucket(String),
    #[error("the specified key does not exist")]
    NoSuchKey,
    #[error("the specified version does not exist")]
    NoSuchVersion,
    #[error("invalid version id `{0}`")]
    InvalidVersion(String),
    #[error("invalid object key")]
    InvalidKey,
    #[error("access denied")]
    AccessDenied,
    #[error("requested range is not satisfiable")]
    InvalidRange,
    #[error("request cancelled")]
    Cancelled,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("payload stream: {0}")]
    Payload(#[source] io::Error),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// Unclassified backend failure, passed through unchanged.
    #[error(transparent)]
    Network(NetworkError),
}

pub type LayerResult<T> = Result<T, LayerError>;

impl LayerError {
    /// Cancellation and deadline errors must never be swallowed by
    /// best-effort paths.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, LayerError::Cancelled | LayerError::DeadlineExceeded)
    }
}

impl From<NetworkError> for LayerError {
    fn from(err: NetworkError) -> Self {
        if err.is_access_denied() {
            return LayerError::AccessDenied;
        }
        match err {
            NetworkError::InvalidRange { .. } => LayerError::InvalidRange,
            other => LayerError::Network(other),
        }
    }
}
