//! Plan reconciliation.
//!
//! The reconciler walks a [`ConvergencePlan`] in dependency order and drives
//! every node to `Ready` through find-or-create. Independent nodes run
//! concurrently, bounded by `max_concurrency`. A node is only started once
//! all of its dependencies are `Ready`; when a node fails, everything that
//! depends on it is failed without touching the provider.

mod node;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::task::JoinError;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::clients::Providers;
use crate::config::EngineConfig;
use crate::drift::DriftGuard;
use crate::error::{ReconcileError, Result};
use crate::plan::ConvergencePlan;
use crate::state::{ResourceState, ResourceStatus, RunReport};

use node::{NodeContext, NodeTask, Resolution};

type TaskOutcome = (usize, std::result::Result<Result<Resolution>, JoinError>);

/// Drives plans to convergence against a set of providers.
pub struct Reconciler {
    ctx: Arc<NodeContext>,
}

impl Reconciler {
    pub fn new(providers: Providers, config: EngineConfig) -> Self {
        Self {
            ctx: Arc::new(NodeContext {
                providers,
                config,
                guard: DriftGuard::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Reconcile `plan` to completion.
    ///
    /// Returns `Err` only when the plan cannot be scheduled at all (a
    /// dependency cycle). Node failures are carried in the report.
    pub async fn reconcile(&self, plan: &ConvergencePlan) -> Result<RunReport> {
        self.reconcile_with_cancel(plan, CancellationToken::new())
            .await
    }

    /// Like [`reconcile`](Self::reconcile), stopping early when `cancel`
    /// fires. Nothing new is started and in-flight resolutions are abandoned,
    /// including provider calls that have not answered yet.
    pub async fn reconcile_with_cancel(
        &self,
        plan: &ConvergencePlan,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let order = plan.topological_order()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("reconcile", run_id = %run_id);

        let report = async move {
            debug!(
                "Resolution order: {:?}",
                order
                    .iter()
                    .map(|&i| plan.specs()[i].logical_name.as_str())
                    .collect::<Vec<_>>()
            );
            let started_at = Utc::now();
            let mut run = Run::new(plan, self.ctx.clone(), cancel);
            run.drive().await;
            let report = run.finish(run_id, started_at);

            if report.is_success() {
                info!("Plan converged ({} resources)", report.states.len());
            } else {
                warn!(
                    "Plan did not converge: {} of {} resources failed",
                    report.failed().count(),
                    report.states.len()
                );
            }
            report
        }
        .instrument(span)
        .await;
        Ok(report)
    }
}

/// Coordinator state for one run. Only the coordinator mutates node state;
/// tasks report back through their join handles.
struct Run<'a> {
    plan: &'a ConvergencePlan,
    ctx: Arc<NodeContext>,
    states: Vec<ResourceState>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Unfinished dependencies per node.
    pending: Vec<usize>,
    ready: BTreeSet<usize>,
    in_flight: FuturesUnordered<BoxFuture<'static, TaskOutcome>>,
    /// Caller's token.
    cancel: CancellationToken,
    /// Run-scoped token handed to node tasks.
    run_token: CancellationToken,
    error: Option<ReconcileError>,
    stopped: Option<ReconcileError>,
}

impl<'a> Run<'a> {
    fn new(plan: &'a ConvergencePlan, ctx: Arc<NodeContext>, cancel: CancellationToken) -> Self {
        let dependencies = plan.dependencies();
        let dependents = plan.dependents();
        let pending: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let ready = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
        let states = plan
            .specs()
            .iter()
            .map(|s| ResourceState::new(s.logical_name.clone(), s.kind))
            .collect();

        Self {
            plan,
            ctx,
            states,
            dependencies,
            dependents,
            pending,
            ready,
            in_flight: FuturesUnordered::new(),
            run_token: cancel.child_token(),
            cancel,
            error: None,
            stopped: None,
        }
    }

    async fn drive(&mut self) {
        let limit = self.ctx.config.max_concurrency.max(1);
        let deadline = self.ctx.config.run_deadline.map(|d| (d, Instant::now() + d));

        loop {
            if self.stopped.is_none() && self.cancel.is_cancelled() {
                self.stop(ReconcileError::Cancelled);
            }
            while self.stopped.is_none() && self.in_flight.len() < limit {
                let Some(idx) = self.ready.pop_first() else {
                    break;
                };
                self.start(idx);
            }

            if self.in_flight.is_empty() {
                break;
            }

            let running = self.stopped.is_none();
            tokio::select! {
                Some((idx, outcome)) = self.in_flight.next() => self.complete(idx, outcome),
                _ = self.cancel.cancelled(), if running => {
                    warn!("Run cancelled, abandoning {} in-flight resources", self.in_flight.len());
                    self.stop(ReconcileError::Cancelled);
                }
                _ = sleep_until_deadline(deadline), if running => {
                    let budget = deadline.map(|(d, _)| d).unwrap_or_default();
                    error!("Run deadline of {:?} exceeded", budget);
                    self.stop(ReconcileError::DeadlineExceeded(budget));
                }
            }
        }
    }

    fn start(&mut self, idx: usize) {
        let spec = self.plan.specs()[idx].clone();
        let dependency_ids: HashMap<String, String> = self.dependencies[idx]
            .iter()
            .filter_map(|&d| {
                let state = &self.states[d];
                state
                    .provider_id
                    .clone()
                    .map(|id| (state.logical_name.clone(), id))
            })
            .collect();

        self.states[idx].status = ResourceStatus::Resolving;
        let span = info_span!("resource", node = %spec.logical_name, kind = %spec.kind);
        let task = NodeTask {
            ctx: self.ctx.clone(),
            spec,
            dependency_ids,
            cancel: self.run_token.clone(),
        };

        let handle = tokio::spawn(task.run().instrument(span));
        self.in_flight
            .push(async move { (idx, handle.await) }.boxed());
    }

    fn complete(&mut self, idx: usize, outcome: std::result::Result<Result<Resolution>, JoinError>) {
        let result = outcome.unwrap_or_else(|e| {
            Err(ReconcileError::TaskAborted(format!(
                "{}: {}",
                self.states[idx].logical_name, e
            )))
        });
        // Tasks abandoned by a stop report the stop reason.
        let result = match (result, &self.stopped) {
            (Err(ReconcileError::Cancelled), Some(reason)) => Err(reason.clone()),
            (result, _) => result,
        };

        match result {
            Ok(resolution) => {
                info!(
                    "{} {} ready ({} {})",
                    self.states[idx].kind,
                    self.states[idx].logical_name,
                    resolution.action,
                    resolution.provider_id
                );
                self.states[idx].mark_ready(
                    resolution.provider_id,
                    resolution.observed,
                    resolution.action,
                );
                for &dependent in &self.dependents[idx] {
                    self.pending[dependent] -= 1;
                    if self.pending[dependent] == 0 {
                        self.ready.insert(dependent);
                    }
                }
            }
            Err(err) => {
                error!(
                    "{} {} failed: {}",
                    self.states[idx].kind, self.states[idx].logical_name, err
                );
                let fatal = err.is_fatal();
                self.fail(idx, err.clone());
                if fatal && self.stopped.is_none() {
                    self.stop(err);
                }
            }
        }
    }

    /// Fail `idx` and every unresolved descendant.
    fn fail(&mut self, idx: usize, err: ReconcileError) {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        self.states[idx].mark_failed(err);

        let mut queue = vec![idx];
        while let Some(failed) = queue.pop() {
            let source = match &self.states[failed].error {
                Some(e) => e.clone(),
                None => continue,
            };
            for &dependent in &self.dependents[failed] {
                if self.states[dependent].status != ResourceStatus::Unresolved {
                    continue;
                }
                self.ready.remove(&dependent);
                let err = ReconcileError::DependencyFailed {
                    node: self.states[dependent].logical_name.clone(),
                    dependency: self.states[failed].logical_name.clone(),
                    source: Box::new(source.clone()),
                };
                debug!("{}", err);
                self.states[dependent].mark_failed(err);
                queue.push(dependent);
            }
        }
    }

    /// Stop scheduling and abandon every in-flight resolution.
    fn stop(&mut self, reason: ReconcileError) {
        self.run_token.cancel();
        if self.error.is_none() {
            self.error = Some(reason.clone());
        }
        self.stopped = Some(reason);
    }

    fn finish(mut self, run_id: String, started_at: chrono::DateTime<Utc>) -> RunReport {
        if let Some(reason) = self.stopped.take() {
            for state in &mut self.states {
                if state.status == ResourceStatus::Unresolved {
                    state.mark_failed(reason.clone());
                }
            }
        }

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            states: self.states,
            error: self.error,
        }
    }
}

async fn sleep_until_deadline(deadline: Option<(Duration, Instant)>) {
    match deadline {
        Some((_, at)) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
