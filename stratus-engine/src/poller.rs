//! Bounded readiness polling for asynchronous resources.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::ResourceClient;
use crate::config::EngineConfig;
use crate::drift::ReadyCondition;
use crate::error::{ReconcileError, Result};
use crate::plan::ResourceKind;

/// Polls `describe_status` until a resource reaches its ready state.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    interval: Duration,
    timeout: Duration,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn for_kind(config: &EngineConfig, kind: ResourceKind) -> Self {
        Self::new(config.poll_interval_for(kind), config.readiness_timeout)
    }

    /// Wait for `id` to satisfy `condition`. Returns the ready status.
    ///
    /// Fails with `ReadinessTimeout` once the timeout elapses, with
    /// `ResourceFailed` on a terminal status, and with `Cancelled` as soon
    /// as `cancel` fires. Both bounds also apply to a `describe_status` call
    /// that never answers.
    pub async fn wait(
        &self,
        client: &dyn ResourceClient,
        kind: ResourceKind,
        id: &str,
        condition: ReadyCondition,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last_status: Option<String> = None;

        loop {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
                status = client.describe_status(kind, id) => status?,
                _ = sleep_until(deadline) => {
                    warn!("{} {} did not answer a status request before the deadline", kind, id);
                    return Err(timed_out(kind, id, started, last_status));
                }
            };

            if condition.is_ready(&status) {
                info!("{} {} is {}", kind, id, status);
                return Ok(status);
            }
            if condition.is_failed(&status) {
                warn!("{} {} entered terminal state {}", kind, id, status);
                return Err(ReconcileError::ResourceFailed {
                    kind,
                    id: id.to_string(),
                    status,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} {} still {} after {:?}, giving up",
                    kind,
                    id,
                    status,
                    now - started
                );
                return Err(timed_out(kind, id, started, Some(status)));
            }

            debug!("Waiting for {} {} (status {})", kind, id, status);
            last_status = Some(status);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
                _ = sleep_until((now + self.interval).min(deadline)) => {}
            }
        }
    }
}

fn timed_out(
    kind: ResourceKind,
    id: &str,
    started: Instant,
    last_status: Option<String>,
) -> ReconcileError {
    ReconcileError::ReadinessTimeout {
        kind,
        id: id.to_string(),
        waited: started.elapsed(),
        last_status: last_status.unwrap_or_else(|| "unknown".to_string()),
    }
}
