//! Per-request execution context.
//!
//! Every logical request carries its own cancellation token and optional
//! deadline. Backend and settings calls are routed through
//! [`RequestContext::run`] so they return promptly once either fires.

use crate::services::error::{LayerError, LayerResult};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Backend-specific call options supplied by the caller layer. The gateway
/// forwards them untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub bearer_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    call_options: CallOptions,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
            call_options: CallOptions::default(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_call_options(mut self, call_options: CallOptions) -> Self {
        self.call_options = call_options;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn call_options(&self) -> &CallOptions {
        &self.call_options
    }

    /// Token shared with spawned work belonging to this request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast when the request is already cancelled or past its deadline.
    pub fn check(&self) -> LayerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(LayerError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LayerError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run a collaborator call under this context's cancellation and deadline.
    pub async fn run<F, T, E>(&self, call: F) -> LayerResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<LayerError>,
    {
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(LayerError::Cancelled),
                res = call => res.map_err(|err| {
                    let err = err.into();
                    if matches!(err, LayerError::AccessDenied) {
                        debug!(request_id = %self.request_id, "backend error was transformed to access denied");
                    }
                    err
                }),
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or(Err(LayerError::DeadlineExceeded)),
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkError;

    #[tokio::test]
    async fn run_passes_results_through() {
        let ctx = RequestContext::new();
        let res: LayerResult<u32> = ctx.run(async { Ok::<_, NetworkError>(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancelled_context_interrupts_pending_call() {
        let ctx = RequestContext::new();
        ctx.cancel();
        let res: LayerResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, NetworkError>(())
            })
            .await;
        assert!(matches!(res, Err(LayerError::Cancelled)));
        assert!(matches!(ctx.check(), Err(LayerError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_interrupts_slow_call() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));
        let res: LayerResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, NetworkError>(())
            })
            .await;
        assert!(matches!(res, Err(LayerError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn dropped_guard_cancels_spawned_work() {
        let ctx = RequestContext::new();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            task_ctx
                .run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, NetworkError>(())
                })
                .await
        });

        drop(ctx.cancellation().clone().drop_guard());
        let res = task.await.unwrap();
        assert!(matches!(res, Err(LayerError::Cancelled)));
    }
}
