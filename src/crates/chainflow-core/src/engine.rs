//! Plan scheduler
//!
//! One scheduler coroutine drives the whole run and owns the runtime tree
//! exclusively. Each pass scans the plan in declared order for eligible
//! nodes (deps complete, not running or paused, poll timer expired,
//! concurrency caps permitting), computes readiness, consults the solver for
//! blocked nodes, gates writes through policy, and dispatches ready nodes
//! onto a task set. The scheduler then suspends until the first task
//! settles or the earliest poll timer fires; all state mutation happens
//! between settlements, so event order reflects causal order.
//!
//! Every state-changing event persists a checkpoint. Pauses unwind into an
//! `engine_paused` event whose state a later run resumes from; a run with no
//! runnable node, nothing in flight, and nothing paused is a deadlock and
//! reported as a global error.

use crate::catalog::ActionCatalog;
use crate::error::{EngineError, ExecutorError};
use crate::events::{EngineEvent, PausedNode};
use crate::executor::{Executor, ExecutorContext, ExecutorOutcome};
use crate::plan::{ExecutionPlan, PlanNode, WriteMode};
use crate::policy::{self, GateDecision, PolicyPack, RiskLevel, SummaryKind};
use crate::readiness::{compute_readiness_async, Readiness, ReadyState};
use crate::runtime::{Patch, PatchGuard, PatchOp, RuntimeTree};
use crate::solver::{SolveContext, Solver};
use crate::trace::{TraceKind, TraceRecord, TraceSink};
use crate::value::Value;
use crate::valueref::{evaluate_value_ref, DetectResolver, EvalContext, ValueRef};
use chainflow_checkpoint::{CheckpointStore, EngineCheckpoint, PauseRecord, PollState};
use futures::{Stream, StreamExt};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global in-flight cap.
    pub max_concurrency: usize,
    /// Per-chain read cap.
    pub max_read_concurrency: usize,
    /// Per-chain write cap.
    pub max_write_concurrency: usize,
    /// Halt the run on the first fatal or executor error.
    pub stop_on_error: bool,
    /// Run identifier, used by trace records.
    pub run_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_read_concurrency: 8,
            max_write_concurrency: 1,
            stop_on_error: true,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl EngineConfig {
    /// Set the global concurrency cap.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Set the per-chain read cap.
    pub fn with_max_read_concurrency(mut self, n: usize) -> Self {
        self.max_read_concurrency = n;
        self
    }

    /// Set the per-chain write cap.
    pub fn with_max_write_concurrency(mut self, n: usize) -> Self {
        self.max_write_concurrency = n;
        self
    }

    /// Keep going after node errors.
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Set the run id.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// Everything a finished [`Engine::run_to_end`] call hands back.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Every emitted event, in order.
    pub events: Vec<EngineEvent>,
}

impl RunOutcome {
    /// Ids of nodes the run completed, from the final checkpoint.
    pub fn completed(&self) -> Vec<String> {
        self.events
            .iter()
            .rev()
            .find_map(|e| match e {
                EngineEvent::CheckpointSaved { checkpoint } => {
                    Some(checkpoint.completed_node_ids.clone())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Whether the run unwound paused.
    pub fn is_paused(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, EngineEvent::EnginePaused { .. }))
    }

    /// Events of a given kind.
    pub fn of_kind(&self, kind: &str) -> Vec<&EngineEvent> {
        self.events.iter().filter(|e| e.kind() == kind).collect()
    }
}

/// The workflow execution engine.
pub struct Engine {
    plan: ExecutionPlan,
    runtime: RuntimeTree,
    config: EngineConfig,
    executors: Vec<Arc<dyn Executor>>,
    solver: Option<Arc<dyn Solver>>,
    detect: Option<Arc<dyn DetectResolver>>,
    store: Option<Arc<dyn CheckpointStore>>,
    trace: Option<Arc<dyn TraceSink>>,
    policy_pack: Option<PolicyPack>,
    catalog: Option<Arc<ActionCatalog>>,
}

impl Engine {
    /// Create an engine over a plan and runtime.
    pub fn new(plan: ExecutionPlan, runtime: RuntimeTree, config: EngineConfig) -> Self {
        Self {
            plan,
            runtime,
            config,
            executors: Vec::new(),
            solver: None,
            detect: None,
            store: None,
            trace: None,
            policy_pack: None,
            catalog: None,
        }
    }

    /// Register an executor. The first registered executor supporting a
    /// node wins.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Attach a solver.
    pub fn with_solver(mut self, solver: Arc<dyn Solver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Attach a detect resolver.
    pub fn with_detect(mut self, detect: Arc<dyn DetectResolver>) -> Self {
        self.detect = Some(detect);
        self
    }

    /// Attach a checkpoint store; enables checkpoint events and resume.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a trace sink.
    pub fn with_trace_sink(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Attach a policy pack; write nodes will be gated.
    pub fn with_policy_pack(mut self, pack: PolicyPack) -> Self {
        self.policy_pack = Some(pack);
        self
    }

    /// Attach an action catalog (calculated fields, risk metadata).
    pub fn with_catalog(mut self, catalog: Arc<ActionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Run the plan, producing the event stream. Trace records mirror the
    /// stream out-of-band; a missing sink changes nothing.
    pub fn run(self) -> impl Stream<Item = EngineEvent> + Send {
        let trace = self.trace.clone();
        let run_id = self.config.run_id.clone();
        let inner = self.run_inner();
        async_stream::stream! {
            if let Some(sink) = &trace {
                sink.append(TraceRecord {
                    kind: TraceKind::Root,
                    id: run_id.clone(),
                    parent_id: None,
                    run_id: run_id.clone(),
                    seq: 0,
                    ts: now_ms(),
                    node_id: None,
                    data: json!({"kind": "run_started"}),
                })
                .await;
            }
            let mut seq = 1u64;
            futures::pin_mut!(inner);
            while let Some(event) = inner.next().await {
                if let Some(sink) = &trace {
                    sink.append(TraceRecord {
                        kind: TraceKind::Event,
                        id: format!("{run_id}:{seq}"),
                        parent_id: Some(run_id.clone()),
                        run_id: run_id.clone(),
                        seq,
                        ts: now_ms(),
                        node_id: event.node().map(str::to_string),
                        data: serde_json::to_value(&event).unwrap_or(Json::Null),
                    })
                    .await;
                }
                seq += 1;
                yield event;
            }
        }
    }

    /// Run to termination, collecting every event.
    pub async fn run_to_end(self) -> RunOutcome {
        let stream = self.run();
        futures::pin_mut!(stream);
        let mut outcome = RunOutcome::default();
        while let Some(event) = stream.next().await {
            outcome.events.push(event);
        }
        outcome
    }

    fn run_inner(self) -> impl Stream<Item = EngineEvent> + Send {
        let Engine {
            plan,
            mut runtime,
            config,
            executors,
            solver,
            detect,
            store,
            trace: _,
            policy_pack,
            catalog,
        } = self;

        async_stream::stream! {
            if let Err(message) = plan.validate() {
                yield EngineEvent::Error {
                    node: None,
                    error: EngineError::Validation(message).to_string(),
                    retryable: false,
                };
                return;
            }

            let plan_json = serde_json::to_value(&plan).unwrap_or(Json::Null);
            let guard = PatchGuard::default();

            let mut completed: BTreeSet<String> = BTreeSet::new();
            let mut paused: BTreeMap<String, PauseRecord> = BTreeMap::new();
            let mut poll: HashMap<String, PollState> = HashMap::new();
            let mut running: HashSet<String> = HashSet::new();
            let mut inflight_params: HashMap<String, BTreeMap<String, Value>> = HashMap::new();
            let mut chain_reads: HashMap<String, usize> = HashMap::new();
            let mut chain_writes: HashMap<String, usize> = HashMap::new();
            let mut tasks: JoinSet<(String, Result<ExecutorOutcome, ExecutorError>)> =
                JoinSet::new();
            let mut fatal = false;

            // Resume from a compatible checkpoint; anything else starts
            // fresh.
            if let Some(store) = &store {
                match store.load().await {
                    Ok(Some(cp)) if cp.is_compatible_with(&plan.node_ids()) => {
                        match RuntimeTree::from_json(&cp.runtime_snapshot) {
                            Ok(restored) => {
                                tracing::info!(
                                    completed = cp.completed_node_ids.len(),
                                    "resuming from checkpoint"
                                );
                                runtime = restored;
                                completed = cp.completed_node_ids.iter().cloned().collect();
                                poll = cp.poll_state_by_node_id.clone();
                            }
                            Err(err) => {
                                tracing::warn!(error = %err,
                                    "checkpoint runtime snapshot unusable; starting fresh");
                            }
                        }
                    }
                    Ok(Some(_)) => {
                        tracing::info!("stored checkpoint incompatible with plan; starting fresh");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "checkpoint load failed; starting fresh");
                    }
                }
            }

            yield EngineEvent::PlanReady;

            'run: loop {
                let mut progressed = false;
                let node_count = plan.nodes.len();
                for index in 0..node_count {
                    let node = plan.nodes[index].clone();
                    let id = node.id.clone();
                    if completed.contains(&id)
                        || running.contains(&id)
                        || paused.contains_key(&id)
                    {
                        continue;
                    }
                    if !node.deps.iter().all(|d| completed.contains(d)) {
                        continue;
                    }
                    let now = now_ms();
                    if let Some(ps) = poll.get(&id) {
                        if now < ps.next_attempt_at_ms {
                            continue;
                        }
                    }
                    let is_read = node.execution.is_read();
                    if running.len() >= config.max_concurrency {
                        continue;
                    }
                    {
                        let (counter, cap) = if is_read {
                            (
                                chain_reads.entry(node.chain.clone()).or_insert(0),
                                config.max_read_concurrency,
                            )
                        } else {
                            (
                                chain_writes.entry(node.chain.clone()).or_insert(0),
                                config.max_write_concurrency,
                            )
                        };
                        if *counter >= cap {
                            continue;
                        }
                    }

                    let readiness =
                        compute_readiness_async(&node, &runtime, detect.as_deref()).await;
                    match readiness.state {
                        ReadyState::Skipped => {
                            let reason = readiness
                                .skip_reason
                                .clone()
                                .unwrap_or_else(|| "skipped".to_string());
                            tracing::debug!(node = %id, %reason, "node skipped");
                            yield EngineEvent::Skipped {
                                node: id.clone(),
                                reason,
                            };
                            completed.insert(id);
                            if let Some(cp) = save_checkpoint(
                                &store, &plan_json, &runtime, &completed, &poll, &paused,
                            )
                            .await
                            {
                                yield EngineEvent::CheckpointSaved { checkpoint: cp };
                            }
                            progressed = true;
                            continue;
                        }
                        ReadyState::Blocked => {
                            yield EngineEvent::NodeBlocked {
                                node: id.clone(),
                                readiness: readiness.clone(),
                            };
                            let Some(solver) = &solver else {
                                let details = serde_json::to_value(&readiness).ok();
                                yield EngineEvent::NodePaused {
                                    node: id.clone(),
                                    reason: "blocked".to_string(),
                                    details: details.clone(),
                                };
                                paused.insert(id, PauseRecord::new("blocked", details));
                                if let Some(cp) = save_checkpoint(
                                    &store, &plan_json, &runtime, &completed, &poll, &paused,
                                )
                                .await
                                {
                                    yield EngineEvent::CheckpointSaved { checkpoint: cp };
                                }
                                progressed = true;
                                continue;
                            };

                            let outcome = {
                                let ctx = SolveContext {
                                    runtime: &runtime,
                                    catalog: catalog.as_deref(),
                                    detect: detect.clone(),
                                };
                                solver.solve(&node, &readiness, &ctx).await
                            };
                            if !outcome.patches.is_empty() {
                                let applied = runtime.apply_patches(&outcome.patches, Some(&guard));
                                tracing::debug!(node = %id, applied = applied.applied,
                                    rejected = applied.rejected.len(), "solver patches applied");
                                yield EngineEvent::SolverApplied {
                                    node: id.clone(),
                                    patches: outcome.patches.clone(),
                                };
                            }
                            if let Some(confirm) = outcome.need_user_confirm {
                                let summary = policy::summary::from_reason(
                                    &node,
                                    &confirm.reason,
                                    confirm.details.as_ref(),
                                );
                                let details = json!({
                                    "summary": summary,
                                    "details": confirm.details,
                                });
                                yield EngineEvent::NeedUserConfirm {
                                    node: id.clone(),
                                    reason: confirm.reason.clone(),
                                    details: Some(details.clone()),
                                };
                                paused.insert(
                                    id,
                                    PauseRecord::new(confirm.reason, Some(details)),
                                );
                                if let Some(cp) = save_checkpoint(
                                    &store, &plan_json, &runtime, &completed, &poll, &paused,
                                )
                                .await
                                {
                                    yield EngineEvent::CheckpointSaved { checkpoint: cp };
                                }
                                progressed = true;
                                continue;
                            }
                            if let Some(cannot) = outcome.cannot_solve {
                                yield EngineEvent::Error {
                                    node: Some(id.clone()),
                                    error: format!("cannot solve: {}", cannot.reason),
                                    retryable: false,
                                };
                                if config.stop_on_error {
                                    fatal = true;
                                    break 'run;
                                }
                                paused.insert(
                                    id,
                                    PauseRecord::new(
                                        format!("cannot solve: {}", cannot.reason),
                                        cannot.details,
                                    ),
                                );
                                progressed = true;
                                continue;
                            }

                            let after =
                                compute_readiness_async(&node, &runtime, detect.as_deref()).await;
                            match after.state {
                                ReadyState::Skipped => {
                                    let reason = after
                                        .skip_reason
                                        .clone()
                                        .unwrap_or_else(|| "skipped".to_string());
                                    yield EngineEvent::Skipped {
                                        node: id.clone(),
                                        reason,
                                    };
                                    completed.insert(id);
                                    if let Some(cp) = save_checkpoint(
                                        &store, &plan_json, &runtime, &completed, &poll, &paused,
                                    )
                                    .await
                                    {
                                        yield EngineEvent::CheckpointSaved { checkpoint: cp };
                                    }
                                    progressed = true;
                                    continue;
                                }
                                ReadyState::Blocked => {
                                    let details = serde_json::to_value(&after).ok();
                                    yield EngineEvent::NodePaused {
                                        node: id.clone(),
                                        reason: "still blocked after solver".to_string(),
                                        details: details.clone(),
                                    };
                                    paused.insert(
                                        id,
                                        PauseRecord::new("still blocked after solver", details),
                                    );
                                    if let Some(cp) = save_checkpoint(
                                        &store, &plan_json, &runtime, &completed, &poll, &paused,
                                    )
                                    .await
                                    {
                                        yield EngineEvent::CheckpointSaved { checkpoint: cp };
                                    }
                                    progressed = true;
                                    continue;
                                }
                                ReadyState::Ready => {
                                    match dispatch(
                                        &node,
                                        after,
                                        &executors,
                                        &policy_pack,
                                        catalog.as_deref(),
                                        &runtime,
                                        detect.clone(),
                                    ) {
                                        Dispatch::Started {
                                            task,
                                            resolved_params,
                                        } => {
                                            yield EngineEvent::NodeReady { node: id.clone() };
                                            bump(
                                                &mut chain_reads,
                                                &mut chain_writes,
                                                &node,
                                                1,
                                            );
                                            if node.until.is_some() {
                                                poll.entry(id.clone()).or_insert(PollState {
                                                    attempts: 0,
                                                    next_attempt_at_ms: 0,
                                                    first_attempt_at_ms: now_ms(),
                                                });
                                            }
                                            inflight_params.insert(id.clone(), resolved_params);
                                            running.insert(id.clone());
                                            tasks.spawn(task);
                                            progressed = true;
                                        }
                                        Dispatch::Gated { event, record } => {
                                            yield event;
                                            paused.insert(id.clone(), record);
                                            if let Some(cp) = save_checkpoint(
                                                &store, &plan_json, &runtime, &completed, &poll,
                                                &paused,
                                            )
                                            .await
                                            {
                                                yield EngineEvent::CheckpointSaved {
                                                    checkpoint: cp,
                                                };
                                            }
                                            progressed = true;
                                        }
                                        Dispatch::Fatal { event } => {
                                            yield event;
                                            if config.stop_on_error {
                                                fatal = true;
                                                break 'run;
                                            }
                                            paused.insert(
                                                id.clone(),
                                                PauseRecord::new("fatal error", None),
                                            );
                                            progressed = true;
                                        }
                                    }
                                    continue;
                                }
                            }
                        }
                        ReadyState::Ready => {
                            match dispatch(
                                &node,
                                readiness,
                                &executors,
                                &policy_pack,
                                catalog.as_deref(),
                                &runtime,
                                detect.clone(),
                            ) {
                                Dispatch::Started {
                                    task,
                                    resolved_params,
                                } => {
                                    yield EngineEvent::NodeReady { node: id.clone() };
                                    bump(&mut chain_reads, &mut chain_writes, &node, 1);
                                    if node.until.is_some() {
                                        poll.entry(id.clone()).or_insert(PollState {
                                            attempts: 0,
                                            next_attempt_at_ms: 0,
                                            first_attempt_at_ms: now_ms(),
                                        });
                                    }
                                    inflight_params.insert(id.clone(), resolved_params);
                                    running.insert(id.clone());
                                    tasks.spawn(task);
                                    progressed = true;
                                }
                                Dispatch::Gated { event, record } => {
                                    yield event;
                                    paused.insert(id.clone(), record);
                                    if let Some(cp) = save_checkpoint(
                                        &store, &plan_json, &runtime, &completed, &poll, &paused,
                                    )
                                    .await
                                    {
                                        yield EngineEvent::CheckpointSaved { checkpoint: cp };
                                    }
                                    progressed = true;
                                }
                                Dispatch::Fatal { event } => {
                                    yield event;
                                    if config.stop_on_error {
                                        fatal = true;
                                        break 'run;
                                    }
                                    paused.insert(
                                        id.clone(),
                                        PauseRecord::new("fatal error", None),
                                    );
                                    progressed = true;
                                }
                            }
                        }
                    }
                }

                let all_done = plan.nodes.iter().all(|n| completed.contains(&n.id));
                if all_done && tasks.is_empty() {
                    break 'run;
                }

                if tasks.is_empty() {
                    if progressed {
                        continue;
                    }
                    // Nothing in flight and nothing schedulable right now.
                    let now = now_ms();
                    let next_wake = poll
                        .iter()
                        .filter(|(id, _)| {
                            !completed.contains(*id) && !paused.contains_key(*id)
                        })
                        .map(|(_, ps)| ps.next_attempt_at_ms)
                        .min();
                    if let Some(at) = next_wake {
                        if at > now {
                            tokio::time::sleep(Duration::from_millis(at - now)).await;
                        }
                        continue;
                    }
                    if !paused.is_empty() {
                        let paused_list: Vec<PausedNode> = paused
                            .iter()
                            .map(|(node, record)| PausedNode {
                                node: node.clone(),
                                reason: record.reason.clone(),
                                details: record.details.clone(),
                            })
                            .collect();
                        tracing::info!(paused = paused_list.len(), "engine paused");
                        yield EngineEvent::EnginePaused { paused: paused_list };
                        if let Some(cp) = save_checkpoint(
                            &store, &plan_json, &runtime, &completed, &poll, &paused,
                        )
                        .await
                        {
                            yield EngineEvent::CheckpointSaved { checkpoint: cp };
                        }
                        break 'run;
                    }
                    let pending: Vec<String> = plan
                        .nodes
                        .iter()
                        .filter(|n| !completed.contains(&n.id))
                        .map(|n| n.id.clone())
                        .collect();
                    yield EngineEvent::Error {
                        node: None,
                        error: EngineError::Deadlock { pending }.to_string(),
                        retryable: false,
                    };
                    break 'run;
                }

                // Suspend: first settlement or earliest poll timer.
                let next_wake = poll
                    .iter()
                    .filter(|(id, _)| !running.contains(*id) && !completed.contains(*id))
                    .map(|(_, ps)| ps.next_attempt_at_ms)
                    .min();
                let wake = {
                    let timer = async {
                        match next_wake {
                            Some(at) => {
                                let now = now_ms();
                                if at > now {
                                    tokio::time::sleep(Duration::from_millis(at - now)).await;
                                }
                            }
                            None => futures::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        joined = tasks.join_next() => Wake::Settled(joined),
                        _ = timer => Wake::Timer,
                    }
                };

                let joined = match wake {
                    Wake::Timer => continue,
                    Wake::Settled(None) => continue,
                    Wake::Settled(Some(joined)) => joined,
                };

                let (id, result) = match joined {
                    Ok(settled) => settled,
                    Err(join_err) => {
                        yield EngineEvent::Error {
                            node: None,
                            error: format!("executor task failed: {join_err}"),
                            retryable: true,
                        };
                        if config.stop_on_error {
                            fatal = true;
                            break 'run;
                        }
                        continue;
                    }
                };

                running.remove(&id);
                let params = inflight_params.remove(&id).unwrap_or_default();
                let Some(node) = plan.node(&id).cloned() else {
                    yield EngineEvent::Error {
                        node: Some(id),
                        error: "settled node is not in the plan".to_string(),
                        retryable: false,
                    };
                    continue;
                };
                bump(&mut chain_reads, &mut chain_writes, &node, -1);

                let outcome = match result {
                    Err(err) => {
                        tracing::warn!(node = %id, error = %err, "executor error");
                        yield EngineEvent::Error {
                            node: Some(id.clone()),
                            error: err.to_string(),
                            retryable: true,
                        };
                        if let Some(cp) = save_checkpoint(
                            &store, &plan_json, &runtime, &completed, &poll, &paused,
                        )
                        .await
                        {
                            yield EngineEvent::CheckpointSaved { checkpoint: cp };
                        }
                        if config.stop_on_error {
                            fatal = true;
                            break 'run;
                        }
                        paused.insert(id, PauseRecord::new(format!("executor error: {err}"), None));
                        continue;
                    }
                    Ok(outcome) => outcome,
                };

                if let Some(confirm) = outcome.need_user_confirm {
                    let summary =
                        policy::summary::from_reason(&node, &confirm.reason, confirm.details.as_ref());
                    let details = json!({"summary": summary, "details": confirm.details});
                    yield EngineEvent::NeedUserConfirm {
                        node: id.clone(),
                        reason: confirm.reason.clone(),
                        details: Some(details.clone()),
                    };
                    paused.insert(id, PauseRecord::new(confirm.reason, Some(details)));
                    if let Some(cp) =
                        save_checkpoint(&store, &plan_json, &runtime, &completed, &poll, &paused)
                            .await
                    {
                        yield EngineEvent::CheckpointSaved { checkpoint: cp };
                    }
                    continue;
                }

                if !outcome.patches.is_empty() {
                    let applied = runtime.apply_patches(&outcome.patches, Some(&guard));
                    tracing::debug!(node = %id, applied = applied.applied,
                        rejected = applied.rejected.len(), "executor patches applied");
                }
                let outputs = outcome.outputs.unwrap_or_default();
                if !outputs.is_empty() {
                    let outputs_value = Value::Map(outputs.clone());
                    let _ = runtime.apply_patch(
                        &Patch::set(format!("nodes.{id}.outputs"), outputs_value.clone()),
                        None,
                    );
                    for write in &node.writes {
                        let op = match write.mode {
                            WriteMode::Set => PatchOp::Set,
                            WriteMode::Merge => PatchOp::Merge,
                        };
                        let result = runtime.apply_patch(
                            &Patch {
                                op,
                                path: write.path.clone(),
                                value: Some(outputs_value.clone()),
                            },
                            Some(&guard),
                        );
                        if let Err(reason) = result {
                            tracing::warn!(node = %id, path = %write.path, %reason,
                                "declared write rejected");
                        }
                    }
                }

                // Event shape: reads report results; writes report
                // sent/confirmed when the executor surfaced them.
                if node.execution.is_read() {
                    yield EngineEvent::QueryResult {
                        node: id.clone(),
                        outputs: outputs.clone(),
                    };
                } else {
                    let is_evm = node.chain.starts_with("eip155:");
                    let hash_key = if is_evm { "tx_hash" } else { "signature" };
                    let receipt_key = if is_evm { "receipt" } else { "confirmation" };
                    let hash = outputs.get(hash_key).and_then(Value::as_str);
                    match hash {
                        Some(hash) => {
                            yield EngineEvent::TxSent {
                                node: id.clone(),
                                tx_hash: hash.to_string(),
                            };
                            if let Some(receipt) = outputs.get(receipt_key) {
                                yield EngineEvent::TxConfirmed {
                                    node: id.clone(),
                                    receipt: receipt.clone(),
                                };
                            }
                        }
                        None => {
                            yield EngineEvent::QueryResult {
                                node: id.clone(),
                                outputs: outputs.clone(),
                            };
                        }
                    }
                }

                // Post-settlement assertion.
                if let Some(assertion) = &node.assertion {
                    let verdict = eval_with_outputs(assertion, &runtime, &outputs, &params);
                    let failure = match verdict {
                        Ok(Value::Bool(true)) => None,
                        Ok(Value::Bool(false)) => Some(
                            node.assert_message
                                .clone()
                                .unwrap_or_else(|| "assertion evaluated to false".to_string()),
                        ),
                        Ok(other) => Some(format!(
                            "assertion must evaluate to bool, got {}",
                            other.type_name()
                        )),
                        Err(err) => Some(format!("assertion failed to evaluate: {err}")),
                    };
                    if let Some(message) = failure {
                        yield EngineEvent::Error {
                            node: Some(id.clone()),
                            error: EngineError::AssertFailed {
                                node: id.clone(),
                                message: message.clone(),
                            }
                            .to_string(),
                            retryable: false,
                        };
                        let details = json!({"message": message});
                        yield EngineEvent::NodePaused {
                            node: id.clone(),
                            reason: "assert failed".to_string(),
                            details: Some(details.clone()),
                        };
                        paused.insert(id, PauseRecord::new("assert failed", Some(details)));
                        if let Some(cp) = save_checkpoint(
                            &store, &plan_json, &runtime, &completed, &poll, &paused,
                        )
                        .await
                        {
                            yield EngineEvent::CheckpointSaved { checkpoint: cp };
                        }
                        continue;
                    }
                }

                // Until / retry polling.
                if let Some(until) = &node.until {
                    let Some(retry) = node.retry.clone() else {
                        yield EngineEvent::Error {
                            node: Some(id.clone()),
                            error: "'until' requires a retry policy".to_string(),
                            retryable: false,
                        };
                        if config.stop_on_error {
                            fatal = true;
                            break 'run;
                        }
                        paused.insert(id, PauseRecord::new("until without retry", None));
                        continue;
                    };
                    let verdict = eval_with_outputs(until, &runtime, &outputs, &params);
                    match verdict {
                        Ok(Value::Bool(true)) => {
                            poll.remove(&id);
                            completed.insert(id.clone());
                            if let Some(cp) = save_checkpoint(
                                &store, &plan_json, &runtime, &completed, &poll, &paused,
                            )
                            .await
                            {
                                yield EngineEvent::CheckpointSaved { checkpoint: cp };
                            }
                        }
                        Ok(Value::Bool(false)) => {
                            let now = now_ms();
                            let state = poll.entry(id.clone()).or_insert(PollState {
                                attempts: 0,
                                next_attempt_at_ms: 0,
                                first_attempt_at_ms: now,
                            });
                            state.attempts += 1;
                            let timed_out = node
                                .timeout_ms
                                .is_some_and(|t| now.saturating_sub(state.first_attempt_at_ms) >= t);
                            let exhausted = retry
                                .max_attempts
                                .is_some_and(|max| state.attempts >= max);
                            if timed_out || exhausted {
                                let error = if timed_out {
                                    format!(
                                        "'until' timed out after {}ms",
                                        node.timeout_ms.unwrap_or_default()
                                    )
                                } else {
                                    format!(
                                        "'until' exhausted {} attempts",
                                        retry.max_attempts.unwrap_or_default()
                                    )
                                };
                                poll.remove(&id);
                                yield EngineEvent::Error {
                                    node: Some(id.clone()),
                                    error: error.clone(),
                                    retryable: false,
                                };
                                if config.stop_on_error {
                                    fatal = true;
                                    break 'run;
                                }
                                paused.insert(id, PauseRecord::new(error, None));
                                continue;
                            }
                            state.next_attempt_at_ms = now + retry.interval_ms;
                            let attempts = state.attempts;
                            let next_attempt_at_ms = state.next_attempt_at_ms;
                            yield EngineEvent::NodeWaiting {
                                node: id.clone(),
                                attempts,
                                next_attempt_at_ms,
                            };
                            if let Some(cp) = save_checkpoint(
                                &store, &plan_json, &runtime, &completed, &poll, &paused,
                            )
                            .await
                            {
                                yield EngineEvent::CheckpointSaved { checkpoint: cp };
                            }
                        }
                        Ok(other) => {
                            yield EngineEvent::Error {
                                node: Some(id.clone()),
                                error: format!(
                                    "'until' must evaluate to bool, got {}",
                                    other.type_name()
                                ),
                                retryable: false,
                            };
                            if config.stop_on_error {
                                fatal = true;
                                break 'run;
                            }
                            paused.insert(id, PauseRecord::new("until evaluation failed", None));
                        }
                        Err(err) => {
                            yield EngineEvent::Error {
                                node: Some(id.clone()),
                                error: format!("'until' failed to evaluate: {err}"),
                                retryable: false,
                            };
                            if config.stop_on_error {
                                fatal = true;
                                break 'run;
                            }
                            paused.insert(id, PauseRecord::new("until evaluation failed", None));
                        }
                    }
                    continue;
                }

                completed.insert(id);
                if let Some(cp) =
                    save_checkpoint(&store, &plan_json, &runtime, &completed, &poll, &paused).await
                {
                    yield EngineEvent::CheckpointSaved { checkpoint: cp };
                }
            }

            if fatal {
                tasks.abort_all();
            }
            for executor in &executors {
                executor.destroy().await;
            }
        }
    }
}

enum Wake {
    Settled(Option<Result<(String, Result<ExecutorOutcome, ExecutorError>), tokio::task::JoinError>>),
    Timer,
}

enum Dispatch {
    Started {
        task: std::pin::Pin<
            Box<
                dyn std::future::Future<Output = (String, Result<ExecutorOutcome, ExecutorError>)>
                    + Send,
            >,
        >,
        resolved_params: BTreeMap<String, Value>,
    },
    Gated {
        event: EngineEvent,
        record: PauseRecord,
    },
    Fatal {
        event: EngineEvent,
    },
}

/// Gate a ready node and build its executor task.
fn dispatch(
    node: &PlanNode,
    readiness: Readiness,
    executors: &[Arc<dyn Executor>],
    policy_pack: &Option<PolicyPack>,
    catalog: Option<&ActionCatalog>,
    runtime: &RuntimeTree,
    detect: Option<Arc<dyn DetectResolver>>,
) -> Dispatch {
    if !node.execution.is_read() {
        if let Some(pack) = policy_pack {
            let (risk_level, risk_tags) = catalog
                .and_then(|c| c.for_source(node.source.as_ref()))
                .map(|def| (def.risk_level, def.risk_tags.clone()))
                .unwrap_or((RiskLevel::Low, Vec::new()));
            let (decision, input) =
                policy::evaluate_gate(pack, node, &readiness, runtime, risk_level, risk_tags);
            match decision {
                GateDecision::Allow => {}
                GateDecision::NeedUserConfirm { reason, details } => {
                    let kind = if reason.contains("allowlisted") {
                        SummaryKind::PolicyAllowlist
                    } else {
                        SummaryKind::PolicyGate
                    };
                    let hit_reasons = details
                        .get("hit_reasons")
                        .and_then(Json::as_array)
                        .map(|hits| {
                            hits.iter()
                                .filter_map(Json::as_str)
                                .map(str::to_string)
                                .collect()
                        });
                    let summary = policy::summary::from_gate_input(kind, node, &input, hit_reasons);
                    let full_details = json!({"summary": summary, "details": details});
                    return Dispatch::Gated {
                        event: EngineEvent::NeedUserConfirm {
                            node: node.id.clone(),
                            reason: reason.clone(),
                            details: Some(full_details.clone()),
                        },
                        record: PauseRecord::new(reason, Some(full_details)),
                    };
                }
                GateDecision::HardBlock { reason, .. } => {
                    return Dispatch::Fatal {
                        event: EngineEvent::Error {
                            node: Some(node.id.clone()),
                            error: EngineError::Policy {
                                reason: reason.clone(),
                            }
                            .to_string(),
                            retryable: false,
                        },
                    };
                }
            }
        }
    }

    let Some(executor) = executors.iter().find(|e| e.supports(node)).cloned() else {
        return Dispatch::Fatal {
            event: EngineEvent::Error {
                node: Some(node.id.clone()),
                error: format!("no executor supports node {:?}", node.id),
                retryable: false,
            },
        };
    };

    let ctx = ExecutorContext {
        runtime: runtime.snapshot(),
        resolved_params: readiness.resolved_params.clone(),
        detect,
    };
    let nested_params = readiness.nested_params();
    let id = node.id.clone();
    let node = node.clone();
    Dispatch::Started {
        task: Box::pin(async move {
            let result = executor.execute(node, ctx).await;
            (id, result)
        }),
        resolved_params: nested_params,
    }
}

fn bump(
    chain_reads: &mut HashMap<String, usize>,
    chain_writes: &mut HashMap<String, usize>,
    node: &PlanNode,
    delta: isize,
) {
    let counters = if node.execution.is_read() {
        chain_reads
    } else {
        chain_writes
    };
    let counter = counters.entry(node.chain.clone()).or_insert(0);
    *counter = counter.saturating_add_signed(delta);
}

/// Evaluate an `assert` / `until` reference with the node's latest outputs
/// and params shadowing the runtime root.
fn eval_with_outputs(
    vref: &ValueRef,
    runtime: &RuntimeTree,
    outputs: &BTreeMap<String, Value>,
    params: &BTreeMap<String, Value>,
) -> Result<Value, crate::error::EvalError> {
    let mut overrides = BTreeMap::new();
    overrides.insert("outputs".to_string(), Value::Map(outputs.clone()));
    overrides.insert("params".to_string(), Value::Map(params.clone()));
    let ctx = EvalContext::with_overrides(runtime, &overrides);
    evaluate_value_ref(vref, &ctx)
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

async fn save_checkpoint(
    store: &Option<Arc<dyn CheckpointStore>>,
    plan_json: &Json,
    runtime: &RuntimeTree,
    completed: &BTreeSet<String>,
    poll: &HashMap<String, PollState>,
    paused: &BTreeMap<String, PauseRecord>,
) -> Option<EngineCheckpoint> {
    let store = store.as_ref()?;
    let mut checkpoint = EngineCheckpoint::new(plan_json.clone(), runtime.to_json());
    checkpoint.completed_node_ids = completed.iter().cloned().collect();
    checkpoint.poll_state_by_node_id = poll.clone();
    checkpoint.paused_by_node_id = paused
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    match store.save(&checkpoint).await {
        Ok(()) => Some(checkpoint),
        Err(err) => {
            tracing::error!(error = %err, "checkpoint save failed");
            None
        }
    }
}
