//! Shared test utilities for stratus-engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stratus_engine::{
    Attributes, Created, DriftGuard, EngineConfig, ErrorCode, FoundResource, LookupKey,
    MemoryProvider, ProviderError, Providers, Reconciler, ResourceClient, ResourceKind,
    ResourceSpec,
};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub kind: ResourceKind,
    /// Lookup key for `find`, `create` and `created`, resource id otherwise.
    pub label: String,
}

#[derive(Default)]
struct Faults {
    fail_create: HashMap<String, ErrorCode>,
    hide_find: HashSet<String>,
    hang_create: HashSet<String>,
    status: HashMap<ResourceKind, String>,
    create_delay: Option<Duration>,
}

/// Wraps a [`MemoryProvider`], recording every call and injecting faults.
///
/// Faults are matched against single lookup-key filters such as
/// `tag:Name=net-3`.
pub struct RecordingClient {
    pub inner: Arc<MemoryProvider>,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<Faults>,
    find_hits: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Self::wrap(Arc::new(MemoryProvider::new()))
    }

    pub fn wrap(inner: Arc<MemoryProvider>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            find_hits: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Make `create` fail with `code` for resources matching `filter`.
    pub fn fail_create(&self, filter: &str, code: ErrorCode) {
        self.faults
            .lock()
            .unwrap()
            .fail_create
            .insert(filter.to_string(), code);
    }

    /// Make the next `find` matching `filter` report nothing, as if the
    /// resource appeared between lookup and creation.
    pub fn hide_next_find(&self, filter: &str) {
        self.faults
            .lock()
            .unwrap()
            .hide_find
            .insert(filter.to_string());
    }

    /// Make `create` never answer for resources matching `filter`.
    pub fn hang_creates(&self, filter: &str) {
        self.faults
            .lock()
            .unwrap()
            .hang_create
            .insert(filter.to_string());
    }

    /// Report `status` for every resource of `kind`.
    pub fn force_status(&self, kind: ResourceKind, status: &str) {
        self.faults
            .lock()
            .unwrap()
            .status
            .insert(kind, status.to_string());
    }

    pub fn delay_creates(&self, delay: Duration) {
        self.faults.lock().unwrap().create_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Labels of calls of type `op`, in call order.
    pub fn labels(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.label)
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    /// Finds that returned an existing resource.
    pub fn find_hits(&self) -> usize {
        self.find_hits.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `create` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
        self.find_hits.store(0, Ordering::SeqCst);
        self.peak.store(0, Ordering::SeqCst);
    }

    fn record(&self, op: &'static str, kind: ResourceKind, label: String) {
        self.calls.lock().unwrap().push(Call { op, kind, label });
    }
}

fn matches(key: &LookupKey, filter: &str) -> bool {
    key.filters()
        .iter()
        .any(|(k, v)| format!("{}={}", k, v) == filter)
}

#[async_trait]
impl ResourceClient for RecordingClient {
    async fn find(
        &self,
        kind: ResourceKind,
        key: &LookupKey,
    ) -> Result<Option<FoundResource>, ProviderError> {
        self.record("find", kind, key.to_string());

        let hidden = {
            let mut faults = self.faults.lock().unwrap();
            let filter = faults
                .hide_find
                .iter()
                .find(|f| matches(key, f))
                .cloned();
            filter.map(|f| faults.hide_find.remove(&f)).unwrap_or(false)
        };
        if hidden {
            return Ok(None);
        }

        let found = self.inner.find(kind, key).await?;
        if found.is_some() {
            self.find_hits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(found)
    }

    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<Created, ProviderError> {
        let key = DriftGuard::new()
            .lookup_key(kind.as_str(), kind, attributes)
            .map_err(|e| ProviderError::new(ErrorCode::InvalidParameter, e.to_string()))?;
        self.record("create", kind, key.to_string());

        let (failure, hang, delay) = {
            let faults = self.faults.lock().unwrap();
            let failure = faults
                .fail_create
                .iter()
                .find(|(f, _)| matches(&key, f))
                .map(|(_, code)| *code);
            let hang = faults.hang_create.iter().any(|f| matches(&key, f));
            (failure, hang, faults.create_delay)
        };
        if let Some(code) = failure {
            return Err(ProviderError::new(code, format!("injected failure for {}", key)));
        }
        if hang {
            std::future::pending::<()>().await;
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.inner.create(kind, attributes).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.record("created", kind, key.to_string());
        result
    }

    async fn modify(
        &self,
        kind: ResourceKind,
        id: &str,
        changes: &Attributes,
    ) -> Result<(), ProviderError> {
        self.record("modify", kind, id.to_string());
        self.inner.modify(kind, id, changes).await
    }

    async fn describe_status(&self, kind: ResourceKind, id: &str) -> Result<String, ProviderError> {
        self.record("describe", kind, id.to_string());
        let forced = self.faults.lock().unwrap().status.get(&kind).cloned();
        match forced {
            Some(status) => Ok(status),
            None => self.inner.describe_status(kind, id).await,
        }
    }

    async fn register(
        &self,
        kind: ResourceKind,
        parent_id: &str,
        child_ids: &[String],
    ) -> Result<(), ProviderError> {
        self.record("register", kind, parent_id.to_string());
        self.inner.register(kind, parent_id, child_ids).await
    }
}

pub fn reconciler(client: Arc<RecordingClient>, config: EngineConfig) -> Reconciler {
    Reconciler::new(Providers::new(client), config)
}

pub fn network(logical: &str, cidr: &str) -> ResourceSpec {
    ResourceSpec::new(ResourceKind::Network, logical)
        .attr("name", logical)
        .attr("cidr_block", cidr)
}

pub fn subnet(logical: &str, network: &str, cidr: &str) -> ResourceSpec {
    ResourceSpec::new(ResourceKind::Subnet, logical)
        .attr("name", logical)
        .reference("network_id", network)
        .attr("cidr_block", cidr)
        .attr("public", true)
}

/// Network, public subnet, internet gateway, and a route table that routes
/// through the gateway for the subnet.
pub fn nsgr() -> Vec<ResourceSpec> {
    vec![
        network("vpc", "10.0.0.0/16"),
        subnet("public-a", "vpc", "10.0.1.0/24"),
        ResourceSpec::new(ResourceKind::InternetGateway, "igw").reference("network_id", "vpc"),
        ResourceSpec::new(ResourceKind::RouteTable, "public-rt")
            .attr("name", "public-rt")
            .reference("network_id", "vpc")
            .reference("gateway_id", "igw")
            .reference("subnet_id", "public-a"),
    ]
}

/// `nsgr` plus a NAT gateway and a route through it.
pub fn with_nat() -> Vec<ResourceSpec> {
    let mut specs = nsgr();
    specs.extend([
        ResourceSpec::new(ResourceKind::NatGateway, "nat")
            .reference("subnet_id", "public-a")
            .depend("igw"),
        ResourceSpec::new(ResourceKind::Route, "nat-route")
            .reference("route_table_id", "public-rt")
            .attr("destination", "0.0.0.0/0")
            .reference("nat_gateway_id", "nat"),
    ]);
    specs
}

pub fn short_timeouts() -> EngineConfig {
    EngineConfig {
        network_poll_interval: Duration::from_secs(5),
        compute_poll_interval: Duration::from_secs(5),
        readiness_timeout: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}
