//! Saga Execution Engine
//!
//! Executes a workflow's step graph respecting wait-for ordering. When a step
//! fails no new steps start, in-flight steps are awaited, and every step that
//! already succeeded is compensated in reverse completion order. A failing
//! compensation is recorded and the wave continues.
//!
//! The engine is the single place that decides the terminal status of an
//! operation and hands it to the operation's completer.

use super::events::{WorkflowEvent, WorkflowOutcome};
use super::graph::{StepGraph, StepNode, StepToken};
use super::invocation::Invocation;
use super::locks::LockManager;
use super::step::{StepRecord, StepState};
use crate::completer::CompleterRef;
use crate::domain::model::OperationStatus;
use crate::error::{Error, Result};
use crate::metrics::OrchestratorMetrics;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =============================================================================
// Invocation Handler
// =============================================================================

/// Performs invocations on behalf of the engine
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn invoke(&self, invocation: &Invocation, ctx: &StepContext) -> Result<()>;
}

pub type InvocationHandlerRef = Arc<dyn InvocationHandler>;

// =============================================================================
// Step Context
// =============================================================================

/// Step-scoped key/value data shared between a step and its compensation
#[derive(Debug, Default)]
pub struct StepDataStore {
    values: DashMap<(StepToken, String), serde_json::Value>,
}

/// What an invocation knows about the step running it
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub op_id: String,
    pub step: StepToken,
    pub label: String,
    /// Set while running a compensation
    pub rolling_back: bool,
    pub cancel: CancellationToken,
    data: Arc<StepDataStore>,
}

impl StepContext {
    /// Store a value under this step
    pub fn store_data<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data.values.insert((self.step, key.to_string()), value);
        Ok(())
    }

    /// Load a value stored by `step`
    pub fn load_data<T: DeserializeOwned>(&self, step: StepToken, key: &str) -> Result<Option<T>> {
        match self.data.values.get(&(step, key.to_string())) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing steps per workflow
    pub max_parallel_steps: usize,
    /// How long a step waits for its named locks
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 16,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Workflow
// =============================================================================

/// One logical operation: identity plus its step graph
#[derive(Debug)]
pub struct Workflow {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub op_id: String,
    pub rollback_allowed: bool,
    graph: StepGraph,
}

impl Workflow {
    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut StepGraph {
        &mut self.graph
    }
}

/// Terminal outcome of a saga
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SagaOutcome {
    Succeeded,
    /// A step failed and every compensation ran
    Compensated { failed_step: String, error: String },
    /// A step failed and at least one compensation failed or was not allowed
    CompensationIncomplete {
        failed_step: String,
        error: String,
        #[serde(default)]
        compensation_error: Option<String>,
    },
}

impl SagaOutcome {
    pub fn kind(&self) -> WorkflowOutcome {
        match self {
            SagaOutcome::Succeeded => WorkflowOutcome::Succeeded,
            SagaOutcome::Compensated { .. } => WorkflowOutcome::Compensated,
            SagaOutcome::CompensationIncomplete { .. } => WorkflowOutcome::CompensationIncomplete,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SagaOutcome::Succeeded)
    }
}

/// What happened during one saga
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaReport {
    pub workflow_id: String,
    pub name: String,
    pub op_id: String,
    pub outcome: SagaOutcome,
    /// Steps in linearized order
    pub steps: Vec<StepRecord>,
    /// Succeeded steps that could not be compensated (irreversible)
    #[serde(default)]
    pub uncompensated: Vec<StepToken>,
    pub duration_ms: u64,
}

impl SagaReport {
    pub fn step(&self, label: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.label == label)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Saga execution engine
pub struct SagaEngine {
    config: EngineConfig,
    handler: InvocationHandlerRef,
    locks: Arc<LockManager>,
    events: broadcast::Sender<WorkflowEvent>,
    metrics: Option<Arc<OrchestratorMetrics>>,
    shutdown: CancellationToken,
}

type StepFuture = BoxFuture<'static, (StepToken, Result<()>)>;

impl SagaEngine {
    pub fn new(config: EngineConfig, handler: InvocationHandlerRef) -> Arc<Self> {
        Self::build(config, handler, None)
    }

    pub fn with_metrics(
        config: EngineConfig,
        handler: InvocationHandlerRef,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Arc<Self> {
        Self::build(config, handler, Some(metrics))
    }

    fn build(
        config: EngineConfig,
        handler: InvocationHandlerRef,
        metrics: Option<Arc<OrchestratorMetrics>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            handler,
            locks: Arc::new(LockManager::new()),
            events,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Subscribe to workflow events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Cancel in-flight bounded waits of every workflow
    pub fn shutdown(&self) {
        info!("Saga engine shutting down");
        self.shutdown.cancel();
    }

    pub fn new_workflow(
        &self,
        owner: impl Into<String>,
        name: impl Into<String>,
        rollback_allowed: bool,
        op_id: impl Into<String>,
    ) -> Workflow {
        Workflow {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            name: name.into(),
            op_id: op_id.into(),
            rollback_allowed,
            graph: StepGraph::new(),
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Move a step along its lifecycle. Illegal moves are logged and refused.
    fn transition(
        &self,
        records: &mut HashMap<StepToken, StepRecord>,
        token: &StepToken,
        next: StepState,
    ) -> bool {
        let Some(record) = records.get_mut(token) else {
            return false;
        };
        if !record.state.can_transition_to(next) {
            warn!(
                "Step '{}' cannot move from {} to {}",
                record.label, record.state, next
            );
            return false;
        }
        record.state = next;
        match next {
            StepState::Executing => record.started_at = Some(Utc::now()),
            StepState::Succeeded
            | StepState::Failed
            | StepState::RolledBack
            | StepState::RollbackFailed => record.finished_at = Some(Utc::now()),
            _ => {}
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_step(next.as_str());
        }
        true
    }

    /// Execute the workflow and report its terminal status to `completer`.
    ///
    /// An invalid graph is reported through the completer and returned as an
    /// error before any step runs. Step failures are not errors here; they
    /// show in the report's outcome.
    pub async fn execute_plan(
        &self,
        workflow: Workflow,
        completer: CompleterRef,
        success_message: &str,
    ) -> Result<SagaReport> {
        let started = Instant::now();
        let order = match workflow.graph.linearize() {
            Ok(order) => order,
            Err(e) => {
                error!("Workflow {} ({}) rejected: {}", workflow.name, workflow.id, e);
                if let Err(ce) = completer.error(e.to_string()).await {
                    warn!("Completer for {} failed: {}", workflow.op_id, ce);
                }
                return Err(e);
            }
        };

        info!(
            "Executing workflow {} ({}) for operation {}: {} steps",
            workflow.name,
            workflow.id,
            workflow.op_id,
            order.len()
        );

        let data = Arc::new(StepDataStore::default());
        let cancel = self.shutdown.child_token();
        let mut records: HashMap<StepToken, StepRecord> = order
            .iter()
            .filter_map(|t| workflow.graph.node(t))
            .map(|node| {
                (
                    node.token,
                    StepRecord {
                        token: node.token,
                        label: node.spec.label.clone(),
                        resource: node.spec.resource.clone(),
                        forward: node.spec.forward.clone(),
                        state: StepState::Created,
                        message: None,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();

        // ---------------------------------------------------------------------
        // Forward execution
        // ---------------------------------------------------------------------
        let mut pending: Vec<StepToken> = order.clone();
        let mut running: FuturesUnordered<StepFuture> = FuturesUnordered::new();
        let mut succeeded: Vec<StepToken> = Vec::new();
        let mut succeeded_set: BTreeSet<StepToken> = BTreeSet::new();
        let mut failure: Option<(StepToken, Error)> = None;
        let max_parallel = self.config.max_parallel_steps.max(1);

        loop {
            if failure.is_none() {
                // Queue every step whose predecessors have all succeeded
                for token in &pending {
                    let ready = workflow.graph.node(token).is_some_and(|node| {
                        node.wait_for
                            .tokens()
                            .iter()
                            .all(|dep| succeeded_set.contains(dep))
                    });
                    let created = records
                        .get(token)
                        .is_some_and(|r| r.state == StepState::Created);
                    if ready && created {
                        self.transition(&mut records, token, StepState::Queued);
                    }
                }

                // Start queued steps while parallelism slots are free
                let mut i = 0;
                while i < pending.len() && running.len() < max_parallel {
                    let token = pending[i];
                    let queued = records
                        .get(&token)
                        .is_some_and(|r| r.state == StepState::Queued);
                    if !queued {
                        i += 1;
                        continue;
                    }
                    pending.remove(i);
                    let Some(node) = workflow.graph.node(&token) else {
                        continue;
                    };
                    self.transition(&mut records, &token, StepState::Executing);
                    self.emit(WorkflowEvent::StepStarted {
                        workflow_id: workflow.id.clone(),
                        step: token,
                        label: node.spec.label.clone(),
                    });
                    running.push(self.spawn_forward(&workflow, node, &data, &cancel));
                }
            }

            let Some((token, result)) = running.next().await else {
                break;
            };
            let label = records.get(&token).map(|r| r.label.clone()).unwrap_or_default();
            match result {
                Ok(()) => {
                    debug!("Step '{}' of workflow {} succeeded", label, workflow.id);
                    self.transition(&mut records, &token, StepState::Succeeded);
                    self.emit(WorkflowEvent::StepSucceeded {
                        workflow_id: workflow.id.clone(),
                        step: token,
                    });
                    succeeded.push(token);
                    succeeded_set.insert(token);
                }
                Err(e) => {
                    error!("Step '{}' of workflow {} failed: {}", label, workflow.id, e);
                    self.transition(&mut records, &token, StepState::Failed);
                    if let Some(record) = records.get_mut(&token) {
                        record.message = Some(e.to_string());
                    }
                    self.emit(WorkflowEvent::StepFailed {
                        workflow_id: workflow.id.clone(),
                        step: token,
                        reason: e.to_string(),
                    });
                    if failure.is_none() {
                        failure = Some((token, e));
                    }
                }
            }
        }

        // Steps never started
        for token in pending {
            self.transition(&mut records, &token, StepState::Cancelled);
            self.emit(WorkflowEvent::StepCancelled {
                workflow_id: workflow.id.clone(),
                step: token,
            });
        }

        // ---------------------------------------------------------------------
        // Compensation
        // ---------------------------------------------------------------------
        let mut uncompensated = Vec::new();
        let outcome = match failure {
            None => SagaOutcome::Succeeded,
            Some((failed, err)) => {
                let failed_label = records.get(&failed).map(|r| r.label.clone()).unwrap_or_default();
                let error_text = format!("Step '{}' failed: {}", failed_label, err);

                if !workflow.rollback_allowed {
                    warn!(
                        "Workflow {} does not allow rollback; {} succeeded steps left applied",
                        workflow.id,
                        succeeded.len()
                    );
                    uncompensated.extend(succeeded.iter().copied());
                    SagaOutcome::CompensationIncomplete {
                        failed_step: failed_label,
                        error: error_text,
                        compensation_error: None,
                    }
                } else {
                    let compensation_error = self
                        .compensate(&workflow, &succeeded, &mut records, &data, &cancel, &mut uncompensated)
                        .await;
                    match compensation_error {
                        None => SagaOutcome::Compensated {
                            failed_step: failed_label,
                            error: error_text,
                        },
                        Some(ce) => SagaOutcome::CompensationIncomplete {
                            failed_step: failed_label,
                            error: error_text,
                            compensation_error: Some(ce),
                        },
                    }
                }
            }
        };

        // ---------------------------------------------------------------------
        // Completion
        // ---------------------------------------------------------------------
        let completion = match &outcome {
            SagaOutcome::Succeeded => completer.ready(Some(success_message.to_string())).await,
            SagaOutcome::Compensated { error, .. } => completer.error(error.clone()).await,
            SagaOutcome::CompensationIncomplete {
                error,
                compensation_error,
                ..
            } => {
                completer.set_rolling_back(true);
                let message = match compensation_error {
                    Some(ce) => format!("{}; {}", error, ce),
                    None => format!("{}; rollback not allowed", error),
                };
                completer.complete(OperationStatus::Error, Some(message)).await
            }
        };
        if let Err(e) = completion {
            warn!("Completer for operation {} failed: {}", workflow.op_id, e);
        }

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_saga(&outcome.kind().to_string(), elapsed);
        }
        self.emit(WorkflowEvent::WorkflowCompleted {
            workflow_id: workflow.id.clone(),
            outcome: outcome.kind(),
        });
        info!(
            "Workflow {} ({}) finished: {} in {:?}",
            workflow.name,
            workflow.id,
            outcome.kind(),
            elapsed
        );

        let steps = order
            .iter()
            .filter_map(|t| records.remove(t))
            .collect();
        Ok(SagaReport {
            workflow_id: workflow.id,
            name: workflow.name,
            op_id: workflow.op_id,
            outcome,
            steps,
            uncompensated,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Build the future running a step's forward action under its locks
    fn spawn_forward(
        &self,
        workflow: &Workflow,
        node: &StepNode,
        data: &Arc<StepDataStore>,
        cancel: &CancellationToken,
    ) -> StepFuture {
        let ctx = StepContext {
            workflow_id: workflow.id.clone(),
            op_id: workflow.op_id.clone(),
            step: node.token,
            label: node.spec.label.clone(),
            rolling_back: false,
            cancel: cancel.clone(),
            data: data.clone(),
        };
        let token = node.token;
        let invocation = node.spec.forward.clone();
        let lock_keys = node.spec.lock_keys.clone();
        let handler = self.handler.clone();
        let locks = self.locks.clone();
        let lock_timeout = self.config.lock_timeout;

        async move {
            let result = async {
                let _held = if lock_keys.is_empty() {
                    None
                } else {
                    Some(locks.acquire(&lock_keys, lock_timeout).await?)
                };
                handler.invoke(&invocation, &ctx).await
            }
            .await;
            (token, result)
        }
        .boxed()
    }

    /// Compensate succeeded steps, last completed first. Returns the first
    /// compensation failure, if any.
    async fn compensate(
        &self,
        workflow: &Workflow,
        succeeded: &[StepToken],
        records: &mut HashMap<StepToken, StepRecord>,
        data: &Arc<StepDataStore>,
        cancel: &CancellationToken,
        uncompensated: &mut Vec<StepToken>,
    ) -> Option<String> {
        let mut first_failure: Option<String> = None;
        info!(
            "Rolling back workflow {}: {} succeeded steps",
            workflow.id,
            succeeded.len()
        );

        for token in succeeded.iter().rev() {
            let Some(node) = workflow.graph.node(token) else {
                continue;
            };
            let Some(rollback) = &node.spec.rollback else {
                warn!(
                    "Step '{}' of workflow {} is irreversible and stays applied",
                    node.spec.label, workflow.id
                );
                uncompensated.push(*token);
                if let Some(metrics) = &self.metrics {
                    metrics.record_compensation("irreversible");
                }
                continue;
            };

            self.transition(records, token, StepState::RollingBack);
            self.emit(WorkflowEvent::RollbackStarted {
                workflow_id: workflow.id.clone(),
                step: *token,
            });

            let ctx = StepContext {
                workflow_id: workflow.id.clone(),
                op_id: workflow.op_id.clone(),
                step: *token,
                label: node.spec.label.clone(),
                rolling_back: true,
                cancel: cancel.clone(),
                data: data.clone(),
            };
            let result = async {
                let _held = if node.spec.lock_keys.is_empty() {
                    None
                } else {
                    Some(
                        self.locks
                            .acquire(&node.spec.lock_keys, self.config.lock_timeout)
                            .await?,
                    )
                };
                self.handler.invoke(rollback, &ctx).await
            }
            .await;

            match result {
                Ok(()) => {
                    debug!("Rolled back step '{}' ({})", node.spec.label, rollback);
                    self.transition(records, token, StepState::RolledBack);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_compensation(if rollback.is_no_op() {
                            "no_op"
                        } else {
                            "rolled_back"
                        });
                    }
                    self.emit(WorkflowEvent::RolledBack {
                        workflow_id: workflow.id.clone(),
                        step: *token,
                    });
                }
                Err(e) => {
                    let failure = Error::CompensationFailed {
                        step: node.spec.label.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{} (continuing rollback)", failure);
                    self.transition(records, token, StepState::RollbackFailed);
                    if let Some(record) = records.get_mut(token) {
                        record.message = Some(failure.to_string());
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.record_compensation("failed");
                    }
                    self.emit(WorkflowEvent::RollbackFailed {
                        workflow_id: workflow.id.clone(),
                        step: *token,
                        reason: e.to_string(),
                    });
                    if first_failure.is_none() {
                        first_failure = Some(failure.to_string());
                    }
                }
            }
        }
        first_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completer::{Completer, TaskCompleter};
    use crate::domain::model::{Host, ResourceId, ResourceKind};
    use crate::domain::ports::TopologyStore;
    use crate::store::InMemoryStore;
    use crate::workflow::graph::{StepSpec, WaitFor};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    /// Records every invocation; fails the ones whose host id is listed
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_forward: Mutex<Vec<String>>,
        fail_rollback: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl InvocationHandler for Recorder {
        async fn invoke(&self, invocation: &Invocation, ctx: &StepContext) -> Result<()> {
            let tag = match invocation {
                Invocation::NoOp => "noop".to_string(),
                Invocation::CreateDirectory { path, .. } => path.clone(),
                Invocation::DeleteDirectory { path, .. } => format!("undo-{}", path),
                other => other.name().to_string(),
            };
            self.calls.lock().push(format!("{}:{}", ctx.label, tag));
            let failing = if ctx.rolling_back {
                &self.fail_rollback
            } else {
                &self.fail_forward
            };
            if failing.lock().contains(&ctx.label) {
                return Err(Error::DeviceOperationFailed {
                    device: "test".into(),
                    operation: tag,
                    reason: "injected".into(),
                });
            }
            Ok(())
        }
    }

    fn step(label: &str) -> StepSpec {
        StepSpec::new(
            label,
            "h1",
            Invocation::CreateDirectory {
                host: "h1".into(),
                path: label.to_string(),
            },
        )
        .with_rollback(Invocation::DeleteDirectory {
            host: "h1".into(),
            path: label.to_string(),
        })
    }

    async fn completer(op: &str) -> (Arc<InMemoryStore>, Arc<TaskCompleter>) {
        let store = InMemoryStore::new();
        store.put_host(Host::new("h1", "esx-01")).await.unwrap();
        let completer = Arc::new(TaskCompleter::for_resource(
            store.clone(),
            ResourceKind::Host,
            ResourceId::from("h1"),
            op,
        ));
        (store, completer)
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let recorder = Arc::new(Recorder::default());
        let engine = SagaEngine::new(EngineConfig::default(), recorder.clone());
        let (store, completer) = completer("op-1").await;

        let mut workflow = engine.new_workflow("test", "chain", true, "op-1");
        let a = workflow.graph_mut().create_step(WaitFor::none(), step("a")).unwrap();
        workflow.graph_mut().create_step(a, step("b")).unwrap();

        let report = engine
            .execute_plan(workflow, completer.clone(), "chain done")
            .await
            .unwrap();
        assert_eq!(report.outcome, SagaOutcome::Succeeded);
        assert_eq!(recorder.calls(), vec!["a:a", "b:b"]);
        assert!(report.steps.iter().all(|s| s.state == StepState::Succeeded));

        let record = store.operation(&"h1".into(), "op-1").await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Ready);
        assert_eq!(record.message.as_deref(), Some("chain done"));
    }

    #[tokio::test]
    async fn test_steps_are_queued_before_executing() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_forward.lock().push("c".into());
        let metrics = OrchestratorMetrics::new().unwrap();
        let engine =
            SagaEngine::with_metrics(EngineConfig::default(), recorder.clone(), metrics.clone());
        let (_store, completer) = completer("op-queued").await;

        let mut workflow = engine.new_workflow("test", "chain", true, "op-queued");
        let a = workflow.graph_mut().create_step(WaitFor::none(), step("a")).unwrap();
        let b = workflow.graph_mut().create_step(a, step("b")).unwrap();
        let c = workflow.graph_mut().create_step(b, step("c")).unwrap();
        workflow.graph_mut().create_step(c, step("d")).unwrap();

        let report = engine
            .execute_plan(workflow, completer, "unused")
            .await
            .unwrap();
        assert_matches!(report.outcome, SagaOutcome::Compensated { .. });

        // d never became ready, so it goes straight from created to cancelled
        assert_eq!(metrics.step_count("queued"), 3);
        assert_eq!(metrics.step_count("executing"), 3);
        assert_eq!(metrics.step_count("succeeded"), 2);
        assert_eq!(metrics.step_count("failed"), 1);
        assert_eq!(metrics.step_count("cancelled"), 1);
        assert_eq!(metrics.step_count("rolled_back"), 2);
        assert_eq!(report.step("d").unwrap().state, StepState::Cancelled);

        let a = report.step("a").unwrap();
        assert!(a.started_at.is_some());
        assert!(a.finished_at.is_some());
        assert!(report.step("d").unwrap().started_at.is_none());
    }

    /// A -> B -> C where C fails: B's compensator runs before A's, and A's
    /// no-op compensator is still invoked
    #[tokio::test]
    async fn test_compensation_runs_in_reverse_order() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_forward.lock().push("c".into());
        let engine = SagaEngine::new(EngineConfig::default(), recorder.clone());
        let (_store, completer) = completer("op-2").await;

        let mut workflow = engine.new_workflow("test", "chain", true, "op-2");
        let graph = workflow.graph_mut();
        let a = graph
            .create_step(
                WaitFor::none(),
                StepSpec::new("a", "h1", Invocation::VerifyMountPoint {
                    host: "h1".into(),
                    path: "/mnt/data".into(),
                    expect_mounted: false,
                })
                .with_no_op_rollback(),
            )
            .unwrap();
        let b = graph.create_step(a, step("b")).unwrap();
        graph.create_step(b, step("c")).unwrap();

        let report = engine.execute_plan(workflow, completer.clone(), "done").await.unwrap();

        assert_eq!(
            recorder.calls(),
            vec!["a:verify_mount_point", "b:b", "c:c", "b:undo-b", "a:noop"]
        );
        assert_matches!(report.outcome, SagaOutcome::Compensated { ref failed_step, .. } if failed_step == "c");
        assert_eq!(report.step("a").unwrap().state, StepState::RolledBack);
        assert_eq!(report.step("b").unwrap().state, StepState::RolledBack);
        assert_eq!(report.step("c").unwrap().state, StepState::Failed);

        // fully compensated: no manual-cleanup annotation
        assert_eq!(completer.status(), OperationStatus::Error);
        assert!(!completer.message().unwrap().contains("manual cleanup"));
    }

    #[tokio::test]
    async fn test_failed_compensation_does_not_stop_the_wave() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_forward.lock().push("c".into());
        recorder.fail_rollback.lock().push("b".into());
        let metrics = OrchestratorMetrics::new().unwrap();
        let engine =
            SagaEngine::with_metrics(EngineConfig::default(), recorder.clone(), metrics.clone());
        let (_store, completer) = completer("op-3").await;

        let mut workflow = engine.new_workflow("test", "chain", true, "op-3");
        let a = workflow.graph_mut().create_step(WaitFor::none(), step("a")).unwrap();
        let b = workflow.graph_mut().create_step(a, step("b")).unwrap();
        workflow.graph_mut().create_step(b, step("c")).unwrap();

        let report = engine.execute_plan(workflow, completer.clone(), "done").await.unwrap();

        assert!(recorder.calls().contains(&"a:undo-a".to_string()));
        assert_eq!(report.step("b").unwrap().state, StepState::RollbackFailed);
        assert_eq!(report.step("a").unwrap().state, StepState::RolledBack);
        assert_matches!(report.outcome, SagaOutcome::CompensationIncomplete { .. });

        assert!(completer.is_rolling_back());
        let message = completer.message().unwrap();
        assert!(message.contains("Compensation of step b failed"));
        assert!(message.ends_with("Host h1 may require manual cleanup"));
        assert_eq!(metrics.saga_count("compensation_incomplete"), 1);
        assert_eq!(metrics.compensation_count("failed"), 1);
    }

    #[tokio::test]
    async fn test_unstarted_steps_are_cancelled_and_irreversible_listed() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_forward.lock().push("boom".into());
        let engine = SagaEngine::new(
            EngineConfig {
                max_parallel_steps: 1,
                ..Default::default()
            },
            recorder.clone(),
        );
        let (_store, completer) = completer("op-4").await;

        let mut workflow = engine.new_workflow("test", "fan", true, "op-4");
        let graph = workflow.graph_mut();
        let delete = graph
            .create_step(
                WaitFor::none(),
                StepSpec::new("delete", "eg-1", Invocation::DeleteExportGroup {
                    group: "eg-1".into(),
                    expected_version: None,
                }),
            )
            .unwrap();
        graph.create_step(delete, step("boom")).unwrap();
        graph.create_step(delete, step("sibling")).unwrap();

        let report = engine.execute_plan(workflow, completer, "done").await.unwrap();
        // with one slot, "sibling" is queued behind "boom" and never starts
        assert_eq!(report.step("sibling").unwrap().state, StepState::Cancelled);
        assert_eq!(report.uncompensated.len(), 1);
        assert_eq!(report.step("delete").unwrap().state, StepState::Succeeded);
    }

    #[tokio::test]
    async fn test_rollback_disallowed_leaves_steps_applied() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_forward.lock().push("b".into());
        let engine = SagaEngine::new(EngineConfig::default(), recorder.clone());
        let (_store, completer) = completer("op-5").await;

        let mut workflow = engine.new_workflow("test", "chain", false, "op-5");
        let a = workflow.graph_mut().create_step(WaitFor::none(), step("a")).unwrap();
        workflow.graph_mut().create_step(a, step("b")).unwrap();

        let report = engine.execute_plan(workflow, completer.clone(), "done").await.unwrap();
        assert_eq!(recorder.calls(), vec!["a:a", "b:b"]);
        assert_matches!(report.outcome, SagaOutcome::CompensationIncomplete { compensation_error: None, .. });
        assert!(completer.message().unwrap().contains("may require manual cleanup"));
    }

    #[tokio::test]
    async fn test_step_data_handoff() {
        struct DataHandler;

        #[async_trait]
        impl InvocationHandler for DataHandler {
            async fn invoke(&self, invocation: &Invocation, ctx: &StepContext) -> Result<()> {
                match invocation {
                    Invocation::RemoveFstabEntry { path, .. } => ctx.store_data("path", path),
                    Invocation::RestoreFstabEntry { path, .. } => {
                        let stored: Option<String> = ctx.load_data(ctx.step, "path")?;
                        assert_eq!(stored.as_deref(), Some(path.as_str()));
                        Ok(())
                    }
                    _ => Err(Error::Internal("forced".into())),
                }
            }
        }

        let engine = SagaEngine::new(EngineConfig::default(), Arc::new(DataHandler));
        let (_store, completer) = completer("op-6").await;
        let mut workflow = engine.new_workflow("test", "data", true, "op-6");
        let remove = workflow
            .graph_mut()
            .create_step(
                WaitFor::none(),
                StepSpec::new("remove", "h1", Invocation::RemoveFstabEntry {
                    host: "h1".into(),
                    path: "/mnt/data".into(),
                })
                .with_rollback(Invocation::RestoreFstabEntry {
                    host: "h1".into(),
                    path: "/mnt/data".into(),
                }),
            )
            .unwrap();
        workflow
            .graph_mut()
            .create_step(remove, StepSpec::new("fail", "h1", Invocation::NoOp))
            .unwrap();

        let report = engine.execute_plan(workflow, completer, "done").await.unwrap();
        assert_eq!(report.step("remove").unwrap().state, StepState::RolledBack);
    }

    #[tokio::test]
    async fn test_invalid_graph_is_reported_before_execution() {
        let recorder = Arc::new(Recorder::default());
        let engine = SagaEngine::new(EngineConfig::default(), recorder.clone());
        let (_store, completer) = completer("op-7").await;

        let mut workflow = engine.new_workflow("test", "broken", true, "op-7");
        let reserved = workflow.graph_mut().create_step_id();
        workflow.graph_mut().create_step(reserved, step("a")).unwrap();

        let res = engine.execute_plan(workflow, completer.clone(), "done").await;
        assert_matches!(res, Err(Error::InvalidStepGraph(_)));
        assert!(recorder.calls().is_empty());
        assert_eq!(completer.status(), OperationStatus::Error);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let recorder = Arc::new(Recorder::default());
        let engine = SagaEngine::new(EngineConfig::default(), recorder);
        let mut events = engine.subscribe();
        let (_store, completer) = completer("op-8").await;

        let mut workflow = engine.new_workflow("test", "one", true, "op-8");
        workflow.graph_mut().create_step(WaitFor::none(), step("a")).unwrap();
        let id = workflow.id.clone();
        engine.execute_plan(workflow, completer, "done").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.workflow_id(), id);
            seen.push(event);
        }
        assert_matches!(seen.first(), Some(WorkflowEvent::StepStarted { .. }));
        assert_matches!(
            seen.last(),
            Some(WorkflowEvent::WorkflowCompleted { outcome: WorkflowOutcome::Succeeded, .. })
        );
    }
}
