use crate::{network::NetworkError, services::error::LayerError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// S3 error code, e.g. `NoSuchKey`.
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<LayerError> for AppError {
    fn from(err: LayerError) -> Self {
        let message = err.to_string();
        match err {
            LayerError::NoSuchBucket(_) => {
                AppError::new(StatusCode::NOT_FOUND, "NoSuchBucket", message)
            }
            LayerError::NoSuchKey => AppError::new(StatusCode::NOT_FOUND, "NoSuchKey", message),
            LayerError::NoSuchVersion => {
                AppError::new(StatusCode::NOT_FOUND, "NoSuchVersion", message)
            }
            LayerError::InvalidVersion(_) => AppError::bad_request("InvalidArgument", message),
            LayerError::InvalidKey => AppError::bad_request("InvalidArgument", message),
            LayerError::AccessDenied => {
                AppError::new(StatusCode::FORBIDDEN, "AccessDenied", message)
            }
            LayerError::InvalidRange => {
                AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, "InvalidRange", message)
            }
            LayerError::Cancelled | LayerError::DeadlineExceeded => {
                AppError::new(StatusCode::REQUEST_TIMEOUT, "RequestTimeout", message)
            }
            LayerError::Payload(_) => AppError::bad_request("IncompleteBody", message),
            LayerError::Network(NetworkError::ContainerAlreadyExists(_)) => {
                AppError::new(StatusCode::CONFLICT, "BucketAlreadyExists", message)
            }
            LayerError::Network(NetworkError::InvalidContainerName { .. }) => {
                AppError::bad_request("InvalidBucketName", message)
            }
            LayerError::Network(NetworkError::UnsupportedRegion(_)) => {
                AppError::bad_request("InvalidLocationConstraint", message)
            }
            LayerError::Settings(_) | LayerError::Network(_) => {
                error!(error = %message, "gateway failure");
                AppError::internal(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_errors_map_to_s3_codes() {
        let err = AppError::from(LayerError::NoSuchVersion);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "NoSuchVersion");

        let err = AppError::from(LayerError::InvalidVersion("x".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = AppError::from(LayerError::DeadlineExceeded);
        assert_eq!(err.code, "RequestTimeout");

        let err = AppError::from(LayerError::Network(NetworkError::ContainerAlreadyExists(
            "b".into(),
        )));
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
