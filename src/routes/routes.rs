//! Routes for the versioned S3 surface.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `GET /{bucket}` lists objects: V1 by default, V2 with `list-type=2`,
//!     versions with `?versions`, versioning status with `?versioning`
//!   - `PUT /{bucket}` creates the bucket, or sets versioning with `?versioning`
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` writes a new version
//!   - `GET    /{bucket}/{*key}` downloads the current or a given `versionId`
//!   - `HEAD   /{bucket}/{*key}` retrieves metadata only
//!   - `DELETE /{bucket}/{*key}` writes a delete marker or removes a version
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    object_handlers::{
        delete_object, get_object, head_object, list_objects, put_bucket, upload_object,
    },
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router for all S3-compatible routes, carrying [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route("/{bucket}", get(list_objects).put(put_bucket))
}
