//! DriftGuard - per-kind idempotency rules.
//!
//! For each resource kind this decides:
//! - the lookup key `find` is called with
//! - whether an existing resource already satisfies the desired attributes,
//!   or which attributes a `modify` call must change
//! - which provider error codes mean "it already exists"
//! - whether creation is asynchronous and what status means ready
//!
//! Modify triggers are deliberately narrow. Security groups, instances and
//! the rest are adopted as found and never reconfigured.

use serde_json::Value;

use crate::clients::LookupKey;
use crate::error::{ErrorCode, ProviderError, ReconcileError};
use crate::plan::{Attributes, ResourceKind};

/// Health-check attributes of a target group that trigger a modify.
const HEALTH_CHECK_ATTRIBUTES: [&str; 6] = [
    "health_check_path",
    "health_check_interval",
    "health_check_timeout",
    "healthy_threshold",
    "unhealthy_threshold",
    "health_check_matcher",
];

/// Statuses that end a readiness wait early with a failure.
const TERMINAL_FAILED: [&str; 5] = [
    "failed",
    "deleted",
    "deleting",
    "unhealthy-terminal",
    "incompatible-parameters",
];

/// Status a freshly created asynchronous resource must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyCondition {
    pub ready: &'static str,
}

impl ReadyCondition {
    pub fn is_ready(&self, status: &str) -> bool {
        status == self.ready
    }

    pub fn is_failed(&self, status: &str) -> bool {
        TERMINAL_FAILED.contains(&status)
    }
}

/// Idempotency rules, one table per resource kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftGuard;

impl DriftGuard {
    pub fn new() -> Self {
        Self
    }

    /// Derive the `find` filters from resolved attributes.
    pub fn lookup_key(
        &self,
        node: &str,
        kind: ResourceKind,
        attrs: &Attributes,
    ) -> Result<LookupKey, ReconcileError> {
        let text = |attribute: &str| required_text(node, attrs, attribute);

        let key = match kind {
            ResourceKind::Network => LookupKey::new().with("tag:Name", text("name")?),
            ResourceKind::Subnet => LookupKey::new()
                .with("network-id", text("network_id")?)
                .with("cidr-block", text("cidr_block")?),
            ResourceKind::InternetGateway => {
                LookupKey::new().with("attachment.network-id", text("network_id")?)
            }
            ResourceKind::NatGateway => LookupKey::new().with("subnet-id", text("subnet_id")?),
            ResourceKind::RouteTable => LookupKey::new()
                .with("network-id", text("network_id")?)
                .with("tag:Name", text("name")?),
            ResourceKind::Route => LookupKey::new()
                .with("route-table-id", text("route_table_id")?)
                .with("destination", text("destination")?),
            ResourceKind::RouteTableAssociation => LookupKey::new()
                .with("route-table-id", text("route_table_id")?)
                .with("subnet-id", text("subnet_id")?),
            ResourceKind::SecurityGroup => LookupKey::new()
                .with("group-name", text("name")?)
                .with("network-id", text("network_id")?),
            ResourceKind::KeyPair => LookupKey::new().with("key-name", text("key_name")?),
            ResourceKind::Instance => LookupKey::new().with("tag:Name", text("name")?),
            ResourceKind::LoadBalancer => LookupKey::new().with("name", text("name")?),
            ResourceKind::TargetGroup => LookupKey::new().with("name", text("name")?),
            ResourceKind::TargetRegistration => {
                LookupKey::new().with("target-group-id", text("target_group_id")?)
            }
            ResourceKind::Listener => LookupKey::new()
                .with("load-balancer-id", text("load_balancer_id")?)
                .with("port", text("port")?),
            ResourceKind::DbSubnetGroup => LookupKey::new().with("name", text("name")?),
            ResourceKind::DatabaseInstance => {
                LookupKey::new().with("identifier", text("identifier")?)
            }
            ResourceKind::ObjectStoreBucket => LookupKey::new().with("bucket", text("bucket")?),
        };
        Ok(key)
    }

    /// Attributes a `modify` (or `register`) call must apply to bring an
    /// existing resource to the desired state. `None` means it already
    /// satisfies the plan.
    pub fn changes(
        &self,
        kind: ResourceKind,
        desired: &Attributes,
        observed: &Attributes,
    ) -> Option<Attributes> {
        match kind {
            ResourceKind::Subnet => {
                let want = desired.get_bool("public")?;
                let have = observed.get_bool("public").unwrap_or(false);
                (want != have).then(|| Attributes::new().with("public", want))
            }
            ResourceKind::RouteTable => missing_entries(desired, observed, "routes"),
            ResourceKind::TargetRegistration => missing_entries(desired, observed, "targets"),
            ResourceKind::TargetGroup => {
                let wanted: Vec<(&str, &Value)> = HEALTH_CHECK_ATTRIBUTES
                    .iter()
                    .filter_map(|&k| desired.get(k).map(|v| (k, v)))
                    .collect();
                let drifted = wanted.iter().any(|(k, v)| observed.get(k) != Some(*v));
                drifted.then(|| {
                    wanted
                        .into_iter()
                        .fold(Attributes::new(), |acc, (k, v)| acc.with(k, v.clone()))
                })
            }
            _ => None,
        }
    }

    /// Provider codes meaning the resource (or permission) already exists.
    pub fn is_duplicate(&self, err: &ProviderError) -> bool {
        matches!(
            err.code,
            ErrorCode::AlreadyExists | ErrorCode::DuplicatePermission
        )
    }

    /// Provider codes meaning the resource does not exist.
    pub fn is_absent(&self, err: &ProviderError) -> bool {
        err.code == ErrorCode::NotFound
    }

    /// Ready condition for asynchronous kinds, `None` for synchronous ones.
    pub fn readiness(&self, kind: ResourceKind) -> Option<ReadyCondition> {
        let ready = match kind {
            ResourceKind::NatGateway => "available",
            ResourceKind::LoadBalancer => "active",
            ResourceKind::DatabaseInstance => "available",
            ResourceKind::Instance => "running",
            ResourceKind::TargetRegistration => "healthy",
            _ => return None,
        };
        Some(ReadyCondition { ready })
    }
}

/// String form of a scalar attribute. Numbers are accepted so ports can be
/// written either way.
fn required_text(node: &str, attrs: &Attributes, attribute: &str) -> Result<String, ReconcileError> {
    match attrs.get(attribute) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ReconcileError::InvalidAttribute {
            node: node.to_string(),
            attribute: attribute.to_string(),
            reason: format!("expected a non-empty string or number, got {}", other),
        }),
        None => Err(ReconcileError::InvalidAttribute {
            node: node.to_string(),
            attribute: attribute.to_string(),
            reason: "missing".to_string(),
        }),
    }
}

/// Desired list entries absent from the observed list, as `{key: [...]}`.
fn missing_entries(desired: &Attributes, observed: &Attributes, key: &str) -> Option<Attributes> {
    let have = observed.get_str_list(key);
    let missing: Vec<String> = desired
        .get_str_list(key)
        .into_iter()
        .filter(|entry| !have.contains(entry))
        .collect();
    (!missing.is_empty()).then(|| Attributes::new().with(key, missing))
}
