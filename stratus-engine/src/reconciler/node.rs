//! Resolution of a single plan node: find, adopt or create, then wait.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clients::{FoundResource, LookupKey, Providers, ResourceClient};
use crate::config::EngineConfig;
use crate::drift::DriftGuard;
use crate::error::{ReconcileError, Result};
use crate::keys::KeyPairTarget;
use crate::plan::{Attributes, ResourceKind, ResourceSpec};
use crate::poller::ReadinessPoller;
use crate::state::Action;

/// Shared, read-only context for node tasks.
pub(crate) struct NodeContext {
    pub providers: Providers,
    pub config: EngineConfig,
    pub guard: DriftGuard,
}

/// A node that reached its desired state.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub provider_id: String,
    pub observed: Attributes,
    pub action: Action,
}

/// Everything one task needs to resolve one node.
pub(crate) struct NodeTask {
    pub ctx: Arc<NodeContext>,
    pub spec: ResourceSpec,
    /// Provider ids of the node's dependencies, by logical name.
    pub dependency_ids: HashMap<String, String>,
    pub cancel: CancellationToken,
}

impl NodeTask {
    /// Resolve the node, giving up as soon as the run is stopped. A provider
    /// call that never answers is abandoned at that point.
    pub async fn run(self) -> Result<Resolution> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReconcileError::Cancelled),
            result = self.resolve() => result,
        }
    }

    async fn resolve(&self) -> Result<Resolution> {
        let name = self.spec.logical_name.as_str();
        let kind = self.spec.kind;

        let desired = self
            .spec
            .attributes
            .resolve(&self.dependency_ids)
            .map_err(|missing| ReconcileError::InvalidAttribute {
                node: name.to_string(),
                attribute: format!("${{{}}}", missing),
                reason: "dependency has no provider id".to_string(),
            })?;
        debug!("Desired attributes: {}", desired);

        let client = self.ctx.providers.client_for(kind)?;
        let key = self.ctx.guard.lookup_key(name, kind, &desired)?;
        let key_pair = match kind {
            ResourceKind::KeyPair => Some(KeyPairTarget::from_attributes(name, &desired)?),
            _ => None,
        };

        if let Some(found) = self.find(client.as_ref(), kind, &key).await? {
            return self
                .adopt(client.as_ref(), found, &desired, key_pair.as_ref())
                .await;
        }

        info!("{} {} not found ({}), creating", kind, name, key);

        let (provider_id, action) = if kind == ResourceKind::TargetRegistration {
            let parent = self.registration_parent(&desired)?;
            let targets = desired.get_str_list("targets");
            self.register(client.as_ref(), &parent, &targets).await?;
            (parent, Action::Registered)
        } else {
            match client.create(kind, &desired).await {
                Ok(created) => {
                    if let Some(target) = &key_pair {
                        target.persist(created.key_material.as_deref()).await?;
                    }
                    info!("{} {} created as {}", kind, name, created.id);
                    (created.id, Action::Created)
                }
                Err(e) if self.ctx.guard.is_duplicate(&e) => {
                    info!(
                        "{} {} already exists ({}), looking it up again",
                        kind, name, e.code
                    );
                    return match self.find(client.as_ref(), kind, &key).await? {
                        Some(found) => {
                            self.adopt(client.as_ref(), found, &desired, key_pair.as_ref())
                                .await
                        }
                        None => Err(e.into()),
                    };
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.wait_ready(client.as_ref(), &provider_id).await?;
        Ok(Resolution {
            provider_id,
            observed: desired,
            action,
        })
    }

    /// `find`, with not-found errors folded into `None`.
    async fn find(
        &self,
        client: &dyn ResourceClient,
        kind: ResourceKind,
        key: &LookupKey,
    ) -> Result<Option<FoundResource>> {
        match client.find(kind, key).await {
            Ok(found) => Ok(found),
            Err(e) if self.ctx.guard.is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Take over an existing resource, applying the modify trigger if its
    /// observed attributes drifted.
    async fn adopt(
        &self,
        client: &dyn ResourceClient,
        found: FoundResource,
        desired: &Attributes,
        key_pair: Option<&KeyPairTarget>,
    ) -> Result<Resolution> {
        let name = self.spec.logical_name.as_str();
        let kind = self.spec.kind;

        if let Some(target) = key_pair {
            target.check_existing().await?;
        }

        let Some(changes) = self.ctx.guard.changes(kind, desired, &found.attributes) else {
            info!("{} {} exists as {}", kind, name, found.id);
            return Ok(Resolution {
                provider_id: found.id,
                observed: found.attributes,
                action: Action::Adopted,
            });
        };

        let mut observed = found.attributes;
        let action = if kind == ResourceKind::TargetRegistration {
            let missing = changes.get_str_list("targets");
            info!("{} {} missing targets {:?}", kind, name, missing);
            self.register(client, &found.id, &missing).await?;
            Action::Registered
        } else {
            info!("{} {} exists as {} but drifted: {}", kind, name, found.id, changes);
            match client.modify(kind, &found.id, &changes).await {
                Ok(()) => {}
                Err(e) if self.ctx.guard.is_duplicate(&e) => {
                    debug!("{} {} modify reported {}, already applied", kind, name, e.code);
                }
                Err(e) => return Err(e.into()),
            }
            Action::Modified
        };
        observed.merge(&changes);

        if action == Action::Registered {
            self.wait_ready(client, &found.id).await?;
        }
        Ok(Resolution {
            provider_id: found.id,
            observed,
            action,
        })
    }

    async fn register(
        &self,
        client: &dyn ResourceClient,
        parent: &str,
        targets: &[String],
    ) -> Result<()> {
        match client.register(self.spec.kind, parent, targets).await {
            Ok(()) => Ok(()),
            Err(e) if self.ctx.guard.is_duplicate(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn registration_parent(&self, desired: &Attributes) -> Result<String> {
        desired
            .get_str("target_group_id")
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::InvalidAttribute {
                node: self.spec.logical_name.clone(),
                attribute: "target_group_id".to_string(),
                reason: "expected a string".to_string(),
            })
    }

    async fn wait_ready(&self, client: &dyn ResourceClient, id: &str) -> Result<()> {
        let kind = self.spec.kind;
        if let Some(condition) = self.ctx.guard.readiness(kind) {
            ReadinessPoller::for_kind(&self.ctx.config, kind)
                .wait(client, kind, id, condition, &self.cancel)
                .await?;
        }
        Ok(())
    }
}
