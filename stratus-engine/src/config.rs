//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan::ResourceKind;

/// Tunables for a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll interval for network-side resources (NAT gateways, load balancers, target health).
    pub network_poll_interval: Duration,
    /// Poll interval for compute-side resources (instances, databases).
    pub compute_poll_interval: Duration,
    /// Upper bound on a single readiness wait.
    pub readiness_timeout: Duration,
    /// Upper bound on the whole run, independent of per-resource timeouts.
    pub run_deadline: Option<Duration>,
    /// Maximum number of nodes resolved at the same time.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network_poll_interval: Duration::from_secs(10),
            compute_poll_interval: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(600),
            run_deadline: None,
            max_concurrency: 8,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval_for(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::Instance | ResourceKind::DatabaseInstance => self.compute_poll_interval,
            _ => self.network_poll_interval,
        }
    }
}
