//! Error types for planning and reconciliation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::plan::ResourceKind;

/// Closed set of provider failure codes.
///
/// Client implementations translate SDK exceptions into one of these at the
/// boundary. Nothing above the client layer ever inspects message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    DuplicatePermission,
    DependencyViolation,
    InvalidParameter,
    LimitExceeded,
    Unauthorized,
    Throttled,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NotFound => "not-found",
            ErrorCode::AlreadyExists => "already-exists",
            ErrorCode::DuplicatePermission => "duplicate-permission",
            ErrorCode::DependencyViolation => "dependency-violation",
            ErrorCode::InvalidParameter => "invalid-parameter",
            ErrorCode::LimitExceeded => "limit-exceeded",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Throttled => "throttled",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A failure reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors detected while building or validating a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("logical name '{0}' is declared more than once")]
    DuplicateName(String),

    #[error("'{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("'{0}' depends on itself")]
    SelfDependency(String),

    #[error("'{node}' ({kind}) is missing required attribute '{attribute}'")]
    MissingAttribute {
        node: String,
        kind: ResourceKind,
        attribute: String,
    },

    #[error("'{node}' references '${{{reference}}}' without declaring it in depends_on")]
    UndeclaredReference { node: String, reference: String },

    #[error("invalid plan document: {0}")]
    Parse(String),
}

/// Errors produced by a reconciliation run.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// The plan contains a dependency cycle. Detected before any provider call.
    #[error("dependency cycle among: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("'{node}' not attempted: dependency '{dependency}' failed")]
    DependencyFailed {
        node: String,
        dependency: String,
        #[source]
        source: Box<ReconcileError>,
    },

    #[error("{kind} {id} not ready after {waited:?} (last status '{last_status}')")]
    ReadinessTimeout {
        kind: ResourceKind,
        id: String,
        waited: Duration,
        last_status: String,
    },

    #[error("{kind} {id} entered terminal state '{status}'")]
    ResourceFailed {
        kind: ResourceKind,
        id: String,
        status: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("key pair '{key_name}' exists at the provider but its private material is not at {}", .path.display())]
    KeyMaterialUnavailable { key_name: String, path: PathBuf },

    #[error("failed to persist private key to {}: {message}", .path.display())]
    KeyPersistence { path: PathBuf, message: String },

    #[error("attribute '{attribute}' of '{node}' is invalid: {reason}")]
    InvalidAttribute {
        node: String,
        attribute: String,
        reason: String,
    },

    #[error("no resource client registered for {0}")]
    NoClient(ResourceKind),

    #[error("node task aborted: {0}")]
    TaskAborted(String),

    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("run deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl ReconcileError {
    /// Whether this error stops the whole run rather than only the failing
    /// node and its descendants.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::ReadinessTimeout { .. }
                | ReconcileError::DeadlineExceeded(_)
                | ReconcileError::Cancelled
        )
    }

    /// The provider code, if this is a provider failure.
    pub fn provider_code(&self) -> Option<ErrorCode> {
        match self {
            ReconcileError::Provider(e) => Some(e.code),
            _ => None,
        }
    }

    /// Follows `DependencyFailed` chains down to the failure that started them.
    pub fn root_cause(&self) -> &ReconcileError {
        match self {
            ReconcileError::DependencyFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;
