pub mod health_handlers;
pub mod object_handlers;

use crate::services::{
    context::{CallOptions, RequestContext},
    gateway::Gateway,
};
use axum::http::{HeaderMap, header};
use std::{sync::Arc, time::Duration};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, request_timeout: Duration) -> Self {
        Self {
            gateway,
            request_timeout,
        }
    }

    /// Fresh context for one request, carrying the caller's bearer token.
    pub fn context(&self, headers: &HeaderMap) -> RequestContext {
        let bearer_token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let ctx = RequestContext::new()
            .with_timeout(self.request_timeout)
            .with_call_options(CallOptions { bearer_token });

        match headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
            Some(id) if !id.is_empty() => ctx.with_request_id(id),
            _ => ctx,
        }
    }
}
