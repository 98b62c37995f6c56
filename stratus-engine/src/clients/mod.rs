//! Provider clients.
//!
//! The reconciler talks to the cloud only through [`ResourceClient`].
//! Implementations translate SDK failures into [`ProviderError`] codes at
//! this boundary:
//! - memory: in-process provider with an optional JSON state file

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ReconcileError};
use crate::plan::{Attributes, ResourceKind};

pub use memory::MemoryProvider;

/// Filters identifying an existing provider resource, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupKey(Vec<(String, String)>);

impl LookupKey {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, filter: &str, value: impl Into<String>) -> Self {
        self.0.push((filter.to_string(), value.into()));
        self
    }

    pub fn get(&self, filter: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == filter)
            .map(|(_, v)| v.as_str())
    }

    pub fn filters(&self) -> &[(String, String)] {
        &self.0
    }
}

impl Default for LookupKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// An existing resource located by `find`.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundResource {
    pub id: String,
    pub attributes: Attributes,
}

/// Result of a `create` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub id: String,
    /// Private key material. Only key pairs return it, and only once.
    pub key_material: Option<String>,
}

impl Created {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key_material: None,
        }
    }
}

/// Capability wrapping the cloud API for the resource kinds it serves.
///
/// Every call may block on the network. `find` is read-only; `create`,
/// `modify` and `register` mutate provider state.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Look up an existing resource. `Ok(None)` when absent.
    async fn find(
        &self,
        kind: ResourceKind,
        key: &LookupKey,
    ) -> Result<Option<FoundResource>, ProviderError>;

    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<Created, ProviderError>;

    async fn modify(
        &self,
        kind: ResourceKind,
        id: &str,
        changes: &Attributes,
    ) -> Result<(), ProviderError>;

    /// Provider status string, e.g. `pending`, `available`, `active`.
    async fn describe_status(&self, kind: ResourceKind, id: &str) -> Result<String, ProviderError>;

    /// Attach `child_ids` to `parent_id` (target-group registration).
    async fn register(
        &self,
        kind: ResourceKind,
        parent_id: &str,
        child_ids: &[String],
    ) -> Result<(), ProviderError>;
}

/// Clients injected into the reconciler, selected per resource kind.
#[derive(Clone, Default)]
pub struct Providers {
    fallback: Option<Arc<dyn ResourceClient>>,
    by_kind: HashMap<ResourceKind, Arc<dyn ResourceClient>>,
}

impl Providers {
    /// One client serving every kind.
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            fallback: Some(client),
            by_kind: HashMap::new(),
        }
    }

    /// No clients; add them with [`Providers::with_kind`].
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: ResourceKind, client: Arc<dyn ResourceClient>) -> Self {
        self.by_kind.insert(kind, client);
        self
    }

    pub fn client_for(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceClient>, ReconcileError> {
        self.by_kind
            .get(&kind)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(ReconcileError::NoClient(kind))
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().collect();
        kinds.sort();
        f.debug_struct("Providers")
            .field("fallback", &self.fallback.is_some())
            .field("by_kind", &kinds)
            .finish()
    }
}
