//! Per-node reconciliation state and the run report.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::Tabled;

use crate::error::ReconcileError;
use crate::plan::{Attributes, ResourceKind};

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Unresolved,
    Resolving,
    Ready,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Unresolved => "unresolved",
            ResourceStatus::Resolving => "resolving",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the engine did to reach `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Existing resource found and taken as-is.
    Adopted,
    Created,
    /// Existing resource found and brought in line with a `modify` call.
    Modified,
    /// Targets attached to an existing parent.
    Registered,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Adopted => "adopted",
            Action::Created => "created",
            Action::Modified => "modified",
            Action::Registered => "registered",
        };
        f.write_str(s)
    }
}

/// State of one plan node. Owned by the reconciler for the length of a run.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub logical_name: String,
    pub kind: ResourceKind,
    pub provider_id: Option<String>,
    pub status: ResourceStatus,
    pub attributes_observed: Attributes,
    pub action: Option<Action>,
    pub error: Option<ReconcileError>,
}

impl ResourceState {
    pub fn new(logical_name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            logical_name: logical_name.into(),
            kind,
            provider_id: None,
            status: ResourceStatus::Unresolved,
            attributes_observed: Attributes::new(),
            action: None,
            error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready
    }

    pub(crate) fn mark_ready(&mut self, provider_id: String, observed: Attributes, action: Action) {
        self.provider_id = Some(provider_id);
        self.attributes_observed = observed;
        self.action = Some(action);
        self.status = ResourceStatus::Ready;
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: ReconcileError) {
        self.status = ResourceStatus::Failed;
        self.error = Some(error);
    }
}

/// One line of the user-facing result table.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct ReportRow {
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "KIND")]
    pub kind: String,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "ACTION")]
    pub action: String,
    #[tabled(rename = "PROVIDER ID")]
    pub provider_id: String,
    #[tabled(rename = "ERROR")]
    pub error: String,
}

impl From<&ResourceState> for ReportRow {
    fn from(state: &ResourceState) -> Self {
        Self {
            name: state.logical_name.clone(),
            kind: state.kind.to_string(),
            status: state.status.to_string(),
            action: state
                .action
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            provider_id: state
                .provider_id
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            error: state
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Outcome of a reconciliation run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// States in plan declaration order.
    pub states: Vec<ResourceState>,
    /// The first failure of the run, if any.
    pub error: Option<ReconcileError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.states.iter().all(ResourceState::is_ready)
    }

    pub fn get(&self, logical_name: &str) -> Option<&ResourceState> {
        self.states.iter().find(|s| s.logical_name == logical_name)
    }

    pub fn provider_id(&self, logical_name: &str) -> Option<&str> {
        self.get(logical_name)
            .and_then(|s| s.provider_id.as_deref())
    }

    /// Number of nodes that reached `Ready` through `action`.
    pub fn count(&self, action: Action) -> usize {
        self.states
            .iter()
            .filter(|s| s.action == Some(action))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ResourceState> {
        self.states
            .iter()
            .filter(|s| s.status == ResourceStatus::Failed)
    }

    pub fn rows(&self) -> Vec<ReportRow> {
        self.states.iter().map(ReportRow::from).collect()
    }

    /// All states keyed by logical name, or the triggering error.
    pub fn into_result(self) -> Result<BTreeMap<String, ResourceState>, ReconcileError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(self
            .states
            .into_iter()
            .map(|s| (s.logical_name.clone(), s))
            .collect())
    }
}
