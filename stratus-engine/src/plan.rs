//! Convergence plan: typed resource specifications and the dependency graph
//! between them.
//!
//! A plan is validated when it is built (unique names, known dependencies,
//! required attributes, declared placeholder references). Acyclicity is
//! checked separately by [`ConvergencePlan::topological_order`], so the
//! reconciler can refuse a cyclic plan before touching the provider.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PlanError, ReconcileError};

/// Resource kinds the engine knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Subnet,
    InternetGateway,
    NatGateway,
    RouteTable,
    Route,
    RouteTableAssociation,
    SecurityGroup,
    KeyPair,
    Instance,
    LoadBalancer,
    TargetGroup,
    TargetRegistration,
    Listener,
    DbSubnetGroup,
    DatabaseInstance,
    ObjectStoreBucket,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 17] = [
        ResourceKind::Network,
        ResourceKind::Subnet,
        ResourceKind::InternetGateway,
        ResourceKind::NatGateway,
        ResourceKind::RouteTable,
        ResourceKind::Route,
        ResourceKind::RouteTableAssociation,
        ResourceKind::SecurityGroup,
        ResourceKind::KeyPair,
        ResourceKind::Instance,
        ResourceKind::LoadBalancer,
        ResourceKind::TargetGroup,
        ResourceKind::TargetRegistration,
        ResourceKind::Listener,
        ResourceKind::DbSubnetGroup,
        ResourceKind::DatabaseInstance,
        ResourceKind::ObjectStoreBucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "internet-gateway",
            ResourceKind::NatGateway => "nat-gateway",
            ResourceKind::RouteTable => "route-table",
            ResourceKind::Route => "route",
            ResourceKind::RouteTableAssociation => "route-table-association",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::KeyPair => "key-pair",
            ResourceKind::Instance => "instance",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::TargetRegistration => "target-registration",
            ResourceKind::Listener => "listener",
            ResourceKind::DbSubnetGroup => "db-subnet-group",
            ResourceKind::DatabaseInstance => "database-instance",
            ResourceKind::ObjectStoreBucket => "object-store-bucket",
        }
    }

    /// Attributes a spec of this kind must carry for its lookup key and
    /// creation call to be derivable.
    pub fn required_attributes(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network => &["name", "cidr_block"],
            ResourceKind::Subnet => &["name", "network_id", "cidr_block"],
            ResourceKind::InternetGateway => &["network_id"],
            ResourceKind::NatGateway => &["subnet_id"],
            ResourceKind::RouteTable => &["name", "network_id"],
            ResourceKind::Route => &["route_table_id", "destination"],
            ResourceKind::RouteTableAssociation => &["route_table_id", "subnet_id"],
            ResourceKind::SecurityGroup => &["name", "network_id"],
            ResourceKind::KeyPair => &["key_name", "key_path"],
            ResourceKind::Instance => &["name"],
            ResourceKind::LoadBalancer => &["name"],
            ResourceKind::TargetGroup => &["name"],
            ResourceKind::TargetRegistration => &["target_group_id", "targets"],
            ResourceKind::Listener => &["load_balancer_id", "port"],
            ResourceKind::DbSubnetGroup => &["name", "subnet_ids"],
            ResourceKind::DatabaseInstance => &["identifier", "master_password"],
            ResourceKind::ObjectStoreBucket => &["bucket"],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the referenced logical name if `s` is a `${name}` placeholder.
pub fn placeholder(s: &str) -> Option<&str> {
    s.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

/// Desired attributes of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// String elements of an array attribute. Non-string elements are skipped.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply `changes` on top of these attributes. Lists are unioned,
    /// everything else is replaced.
    pub fn merge(&mut self, changes: &Attributes) {
        for (key, value) in changes.iter() {
            let merged = match (self.0.get(key), value) {
                (Some(Value::Array(existing)), Value::Array(added)) => {
                    let mut merged = existing.clone();
                    for item in added {
                        if !merged.contains(item) {
                            merged.push(item.clone());
                        }
                    }
                    Value::Array(merged)
                }
                _ => value.clone(),
            };
            self.0.insert(key.clone(), merged);
        }
    }

    /// Logical names referenced through `${name}` placeholders.
    pub fn references(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for value in self.0.values() {
            match value {
                Value::String(s) => {
                    if let Some(name) = placeholder(s) {
                        refs.insert(name.to_string());
                    }
                }
                Value::Array(items) => {
                    for name in items.iter().filter_map(Value::as_str).filter_map(placeholder) {
                        refs.insert(name.to_string());
                    }
                }
                _ => {}
            }
        }
        refs
    }

    /// Substitutes placeholders with provider ids. Returns the first
    /// reference that has no id.
    pub fn resolve(&self, ids: &HashMap<String, String>) -> Result<Attributes, String> {
        let substitute = |s: &str| -> Result<Value, String> {
            match placeholder(s) {
                Some(name) => ids
                    .get(name)
                    .map(|id| Value::String(id.clone()))
                    .ok_or_else(|| name.to_string()),
                None => Ok(Value::String(s.to_string())),
            }
        };

        let mut out = BTreeMap::new();
        for (key, value) in &self.0 {
            let resolved = match value {
                Value::String(s) => substitute(s)?,
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => substitute(s),
                            other => Ok(other.clone()),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                other => other.clone(),
            };
            out.insert(key.clone(), resolved);
        }
        Ok(Attributes(out))
    }

    /// Copy with secret-looking values masked, for logging.
    pub fn redacted(&self) -> Attributes {
        Attributes(
            self.0
                .iter()
                .map(|(k, v)| {
                    let lower = k.to_ascii_lowercase();
                    if lower.contains("password") || lower.contains("secret") {
                        (k.clone(), Value::String("***".to_string()))
                    } else {
                        (k.clone(), v.clone())
                    }
                })
                .collect(),
        )
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = self.redacted();
        let json = serde_json::to_string(&redacted.0).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Desired state of one resource in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    #[serde(rename = "name")]
    pub logical_name: String,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, logical_name: impl Into<String>) -> Self {
        Self {
            kind,
            logical_name: logical_name.into(),
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    /// Sets an attribute to the provider id of `dependency` and records the edge.
    pub fn reference(mut self, key: impl Into<String>, dependency: &str) -> Self {
        self.attributes
            .insert(key, Value::String(format!("${{{}}}", dependency)));
        self.depend(dependency)
    }

    /// Sets an array attribute to the provider ids of `dependencies`.
    pub fn reference_list(mut self, key: impl Into<String>, dependencies: &[&str]) -> Self {
        let values: Vec<Value> = dependencies
            .iter()
            .map(|d| Value::String(format!("${{{}}}", d)))
            .collect();
        self.attributes.insert(key, Value::Array(values));
        for dep in dependencies {
            self = self.depend(dep);
        }
        self
    }

    pub fn depend(mut self, dependency: &str) -> Self {
        if !self.depends_on.iter().any(|d| d == dependency) {
            self.depends_on.push(dependency.to_string());
        }
        self
    }
}

/// On-disk representation of a plan.
#[derive(Debug, Serialize, Deserialize)]
struct PlanDocument {
    resources: Vec<ResourceSpec>,
}

/// A validated set of resource specs with dependency edges between them.
#[derive(Debug, Clone)]
pub struct ConvergencePlan {
    specs: Vec<ResourceSpec>,
    index: HashMap<String, usize>,
}

impl ConvergencePlan {
    pub fn new(mut specs: Vec<ResourceSpec>) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(specs.len());

        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.logical_name.clone(), i).is_some() {
                return Err(PlanError::DuplicateName(spec.logical_name.clone()));
            }
        }

        for spec in &mut specs {
            let mut seen = HashSet::new();
            spec.depends_on.retain(|d| seen.insert(d.clone()));
        }

        for spec in &specs {
            for dep in &spec.depends_on {
                if dep == &spec.logical_name {
                    return Err(PlanError::SelfDependency(dep.clone()));
                }
                if !index.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        node: spec.logical_name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            for attribute in spec.kind.required_attributes() {
                if !spec.attributes.contains(attribute) {
                    return Err(PlanError::MissingAttribute {
                        node: spec.logical_name.clone(),
                        kind: spec.kind,
                        attribute: attribute.to_string(),
                    });
                }
            }

            for reference in spec.attributes.references() {
                if !spec.depends_on.contains(&reference) {
                    return Err(PlanError::UndeclaredReference {
                        node: spec.logical_name.clone(),
                        reference,
                    });
                }
            }
        }

        Ok(Self { specs, index })
    }

    pub fn from_json(input: &str) -> Result<Self, PlanError> {
        let doc: PlanDocument =
            serde_json::from_str(input).map_err(|e| PlanError::Parse(e.to_string()))?;
        Self::new(doc.resources)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&PlanDocument {
            resources: self.specs.clone(),
        })
    }

    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, logical_name: &str) -> Option<&ResourceSpec> {
        self.index.get(logical_name).map(|&i| &self.specs[i])
    }

    pub fn position(&self, logical_name: &str) -> Option<usize> {
        self.index.get(logical_name).copied()
    }

    /// Indices of the nodes each node depends on.
    pub fn dependencies(&self) -> Vec<Vec<usize>> {
        self.specs
            .iter()
            .map(|s| s.depends_on.iter().map(|d| self.index[d]).collect())
            .collect()
    }

    /// Indices of the nodes that depend on each node, in declaration order.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.specs.len()];
        for (i, deps) in self.dependencies().into_iter().enumerate() {
            for d in deps {
                out[d].push(i);
            }
        }
        out
    }

    /// Stable topological order: among nodes whose dependencies are all
    /// placed, the earliest declared goes first.
    pub fn topological_order(&self) -> Result<Vec<usize>, ReconcileError> {
        let dependents = self.dependents();
        let mut indegree: Vec<usize> = self.specs.iter().map(|s| s.depends_on.len()).collect();
        let mut ready: BTreeSet<usize> = (0..indegree.len()).filter(|&i| indegree[i] == 0).collect();

        let mut order = Vec::with_capacity(self.specs.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.specs.len() {
            let stuck = (0..indegree.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.specs[i].logical_name.clone())
                .collect();
            return Err(ReconcileError::Cycle(stuck));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(name: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceKind::Network, name)
            .attr("name", name)
            .attr("cidr_block", "10.0.0.0/16")
    }

    fn names(plan: &ConvergencePlan, order: &[usize]) -> Vec<String> {
        order
            .iter()
            .map(|&i| plan.specs()[i].logical_name.clone())
            .collect()
    }

    #[test]
    fn test_topological_order_breaks_ties_by_declaration() {
        let plan = ConvergencePlan::new(vec![
            net("c").depend("a"),
            net("b"),
            net("a"),
            net("d").depend("b").depend("c"),
        ])
        .unwrap();

        let order = plan.topological_order().unwrap();
        assert_eq!(names(&plan, &order), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn test_cycle_is_reported_with_members() {
        let plan = ConvergencePlan::new(vec![net("a").depend("b"), net("b").depend("a"), net("c")])
            .unwrap();

        match plan.topological_order() {
            Err(ReconcileError::Cycle(nodes)) => assert_eq!(nodes, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = ConvergencePlan::new(vec![net("a"), net("a")]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateName("a".into()));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = ConvergencePlan::new(vec![net("a").depend("ghost")]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = ConvergencePlan::new(vec![net("a").depend("a")]).unwrap_err();
        assert_eq!(err, PlanError::SelfDependency("a".into()));
    }

    #[test]
    fn test_missing_required_attribute() {
        let spec = ResourceSpec::new(ResourceKind::Subnet, "s")
            .attr("name", "s")
            .attr("cidr_block", "10.0.1.0/24");
        let err = ConvergencePlan::new(vec![spec]).unwrap_err();
        assert_eq!(
            err,
            PlanError::MissingAttribute {
                node: "s".into(),
                kind: ResourceKind::Subnet,
                attribute: "network_id".into(),
            }
        );
    }

    #[test]
    fn test_placeholder_must_be_declared() {
        let spec = ResourceSpec::new(ResourceKind::InternetGateway, "igw")
            .attr("network_id", "${vpc}");
        let err = ConvergencePlan::new(vec![net("vpc"), spec]).unwrap_err();
        assert!(matches!(err, PlanError::UndeclaredReference { .. }));
    }

    #[test]
    fn test_resolve_substitutes_scalars_and_lists() {
        let attrs = Attributes::new()
            .with("network_id", "${vpc}")
            .with("subnets", vec!["${a}", "${b}", "literal"])
            .with("port", 80);
        let ids: HashMap<String, String> = [("vpc", "vpc-1"), ("a", "subnet-1"), ("b", "subnet-2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let resolved = attrs.resolve(&ids).unwrap();
        assert_eq!(resolved.get_str("network_id"), Some("vpc-1"));
        assert_eq!(
            resolved.get_str_list("subnets"),
            vec!["subnet-1", "subnet-2", "literal"]
        );
        assert_eq!(resolved.get_u64("port"), Some(80));

        let missing = Attributes::new().with("x", "${nope}").resolve(&ids);
        assert_eq!(missing, Err("nope".to_string()));
    }

    #[test]
    fn test_merge_unions_lists_and_replaces_scalars() {
        let mut observed = Attributes::new()
            .with("targets", vec!["i-1", "i-2"])
            .with("public", false);
        observed.merge(
            &Attributes::new()
                .with("targets", vec!["i-2", "i-3"])
                .with("public", true),
        );
        assert_eq!(observed.get_str_list("targets"), vec!["i-1", "i-2", "i-3"]);
        assert_eq!(observed.get_bool("public"), Some(true));
    }

    #[test]
    fn test_display_redacts_secrets() {
        let attrs = Attributes::new()
            .with("identifier", "db")
            .with("master_password", "hunter2");
        let shown = attrs.to_string();
        assert!(shown.contains("db"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_plan_json_roundtrip_keeps_edges() {
        let input = r#"{
            "resources": [
                {"kind": "network", "name": "vpc", "attributes": {"name": "main", "cidr_block": "10.0.0.0/16"}},
                {"kind": "internet-gateway", "name": "igw", "attributes": {"network_id": "${vpc}"}, "depends_on": ["vpc"]}
            ]
        }"#;
        let plan = ConvergencePlan::from_json(input).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.get("igw").unwrap().kind, ResourceKind::InternetGateway);

        let again = ConvergencePlan::from_json(&plan.to_json_pretty().unwrap()).unwrap();
        assert_eq!(again.get("igw").unwrap().depends_on, vec!["vpc"]);
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        let input = r#"{"resources": [{"kind": "dns-zone", "name": "z"}]}"#;
        assert!(matches!(
            ConvergencePlan::from_json(input),
            Err(PlanError::Parse(_))
        ));
    }
}
