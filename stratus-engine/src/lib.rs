//! stratus-engine: declarative find-or-create reconciliation of cloud
//! resource graphs.
//!
//! A [`ConvergencePlan`] declares resources and the dependency edges between
//! them. The [`Reconciler`] walks the plan in dependency order and, for every
//! node, looks the resource up by its natural key, adopts it if present
//! (applying a narrow set of modify triggers), creates it otherwise, and
//! waits for asynchronous resources to become ready. Running the same plan
//! twice performs no creations the second time.

pub mod blueprint;
pub mod clients;
pub mod config;
pub mod drift;
pub mod error;
pub mod keys;
pub mod plan;
pub mod poller;
pub mod reconciler;
pub mod state;

pub use blueprint::{DatabaseOptions, WebStackBlueprint, WebStackOptions};
pub use clients::{Created, FoundResource, LookupKey, MemoryProvider, Providers, ResourceClient};
pub use config::EngineConfig;
pub use drift::{DriftGuard, ReadyCondition};
pub use error::{ErrorCode, PlanError, ProviderError, ReconcileError, Result};
pub use plan::{Attributes, ConvergencePlan, ResourceKind, ResourceSpec};
pub use poller::ReadinessPoller;
pub use reconciler::Reconciler;
pub use state::{Action, ReportRow, ResourceState, ResourceStatus, RunReport};
