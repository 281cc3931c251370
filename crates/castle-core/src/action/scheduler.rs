//! Concurrent execution of an action dependency graph.
//!
//! Every action in the requested closure gets one tokio task. The task waits
//! for the completion signal of each predecessor, observes the action's
//! initial delay, then runs `Action::call` on a blocking thread. Independent
//! branches proceed in parallel; concurrency is bounded only by the edges of
//! the graph. The status map is the only shared critical section.
//!
//! # State machine
//!
//! `Waiting → Ready → Running → Done | Failed`. An action whose predecessor
//! did not finish `Done` moves straight to `Skipped` without being invoked.
//!
//! # Timeout and cancellation
//!
//! `await_completion` enforces a wall-clock budget. When it expires, nothing
//! new is dispatched: actions still waiting on dependencies or on their
//! initial delay end as `Cancelled`. Actions already inside `call` are left
//! to finish on their blocking thread and are not awaited; they are reported
//! as `Running`. `close` (and `Drop`) apply the same policy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::action::{Action, ActionDependencyGraph, ActionId, TargetId};
use crate::cluster::CastleCluster;
use crate::error::{CastleError, Result};
use crate::return_code::CastleReturnCode;

// ---------------------------------------------------------------------------
// ActionStatus / ActionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Waiting,
    Ready,
    Running,
    Done,
    /// `call` returned an error; `cause` holds the rendered cause chain.
    Failed { cause: String },
    /// Not invoked because `blocked_by` did not complete.
    Skipped { blocked_by: String },
    /// Not invoked because the run timed out or was closed.
    Cancelled,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Done
                | ActionStatus::Failed { .. }
                | ActionStatus::Skipped { .. }
                | ActionStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActionStatus::Waiting => "waiting",
            ActionStatus::Ready => "ready",
            ActionStatus::Running => "running",
            ActionStatus::Done => "done",
            ActionStatus::Failed { .. } => "failed",
            ActionStatus::Skipped { .. } => "skipped",
            ActionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    #[serde(flatten)]
    pub status: ActionStatus,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms_opt")]
    pub elapsed: Option<Duration>,
}

impl ActionRecord {
    fn waiting() -> Self {
        Self {
            status: ActionStatus::Waiting,
            started_at: None,
            elapsed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerReport
// ---------------------------------------------------------------------------

/// Final per-action outcome of one `await_completion` call.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub records: BTreeMap<String, ActionRecord>,
    pub timed_out: bool,
    pub return_code: CastleReturnCode,
}

impl SchedulerReport {
    pub fn status_of(&self, id: &ActionId) -> Option<&ActionStatus> {
        self.records.get(&id.to_string()).map(|r| &r.status)
    }

    pub fn ids_with(&self, pred: impl Fn(&ActionStatus) -> bool) -> Vec<&str> {
        self.records
            .iter()
            .filter(|(_, r)| pred(&r.status))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn all_done(&self) -> bool {
        !self.timed_out
            && self
                .records
                .values()
                .all(|r| r.status == ActionStatus::Done)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ActionSchedulerBuilder {
    cluster: Arc<CastleCluster>,
    target_names: Vec<String>,
    actions: Vec<Arc<dyn Action>>,
}

impl ActionSchedulerBuilder {
    pub fn add_target_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn add_actions(mut self, actions: impl IntoIterator<Item = Arc<dyn Action>>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Build the dependency graph and resolve the requested targets.
    ///
    /// Fails before anything runs on duplicate ids, cycles, actions scoped
    /// to unknown nodes, or target names that match nothing.
    pub fn build(self) -> Result<ActionScheduler> {
        let graph = ActionDependencyGraph::new(self.actions)?;
        for id in graph.all_ids() {
            if self.cluster.node(id.scope()).is_none() {
                return Err(CastleError::UnknownNode(format!(
                    "{} (scope of action {id})",
                    id.scope()
                )));
            }
        }
        let mut to_run = BTreeSet::new();
        for name in &self.target_names {
            let target = TargetId::parse(name);
            let target = if target.scope().is_empty() {
                target
            } else {
                let node = self.cluster.node_by_name_or_index(target.scope())?;
                TargetId::new(target.action_type(), node)
            };
            let resolved = graph.resolve(&target);
            if resolved.is_empty() {
                return Err(CastleError::UnknownTarget(name.clone()));
            }
            to_run.extend(resolved);
        }
        tracing::debug!(
            targets = ?self.target_names,
            actions = to_run.len(),
            "resolved scheduler targets"
        );
        Ok(ActionScheduler::new(self.cluster, Arc::new(graph), to_run))
    }
}

// ---------------------------------------------------------------------------
// ActionScheduler
// ---------------------------------------------------------------------------

/// What a finished action tells its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Done,
    NotDone,
}

struct RunState {
    cluster: Arc<CastleCluster>,
    graph: Arc<ActionDependencyGraph>,
    records: Mutex<BTreeMap<ActionId, ActionRecord>>,
    signals: BTreeMap<ActionId, watch::Sender<Option<Completion>>>,
    cancel: watch::Sender<bool>,
}

impl RunState {
    fn set_status(&self, id: &ActionId, status: ActionStatus) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(id) {
            record.status = status;
        }
    }

    fn mark_running(&self, id: &ActionId) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(id) {
            record.status = ActionStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }

    fn finish(&self, id: &ActionId, status: ActionStatus, elapsed: Option<Duration>) {
        let completion = if status == ActionStatus::Done {
            Completion::Done
        } else {
            Completion::NotDone
        };
        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = records.get_mut(id) {
                record.status = status;
                record.elapsed = elapsed;
            }
        }
        if let Some(signal) = self.signals.get(id) {
            signal.send_replace(Some(completion));
        }
    }

    fn snapshot(&self) -> BTreeMap<ActionId, ActionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ActionScheduler {
    state: Arc<RunState>,
    to_run: BTreeSet<ActionId>,
    tasks: Option<JoinSet<()>>,
    report: Option<SchedulerReport>,
}

impl ActionScheduler {
    pub fn builder(cluster: Arc<CastleCluster>) -> ActionSchedulerBuilder {
        ActionSchedulerBuilder {
            cluster,
            target_names: Vec::new(),
            actions: Vec::new(),
        }
    }

    fn new(
        cluster: Arc<CastleCluster>,
        graph: Arc<ActionDependencyGraph>,
        to_run: BTreeSet<ActionId>,
    ) -> Self {
        let records = to_run
            .iter()
            .map(|id| (id.clone(), ActionRecord::waiting()))
            .collect();
        let signals = to_run
            .iter()
            .map(|id| (id.clone(), watch::channel(None).0))
            .collect();
        let (cancel, _) = watch::channel(false);
        Self {
            state: Arc::new(RunState {
                cluster,
                graph,
                records: Mutex::new(records),
                signals,
                cancel,
            }),
            to_run,
            tasks: None,
            report: None,
        }
    }

    /// The ids this scheduler will execute, i.e. the closure of its targets.
    pub fn action_ids(&self) -> &BTreeSet<ActionId> {
        &self.to_run
    }

    pub fn graph(&self) -> &ActionDependencyGraph {
        &self.state.graph
    }

    /// Run every action in the closure and wait until all of them reach a
    /// terminal state or `timeout` elapses.
    ///
    /// The aggregate return code is folded into the cluster's shutdown
    /// manager. Calling this again after completion returns the same report.
    pub async fn await_completion(&mut self, timeout: Duration) -> SchedulerReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let mut tasks = self.tasks.take().unwrap_or_else(|| self.spawn_all());
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!("scheduler task panicked: {e}");
                    }
                }
            }
        })
        .await;
        let timed_out = drained.is_err();
        if timed_out {
            tracing::error!(
                "timed out after {:.1}s waiting for actions to complete",
                timeout.as_secs_f64()
            );
            self.cancel_pending(&mut tasks).await;
        }
        self.tasks = Some(tasks);
        let report = self.build_report(timed_out);
        self.report = Some(report.clone());
        report
    }

    /// Stop dispatching and release the scheduler's tasks. Never blocks on
    /// actions which are still inside `call`.
    pub fn close(&mut self) {
        self.state.cancel.send_replace(true);
        if let Some(mut tasks) = self.tasks.take() {
            tasks.abort_all();
            tasks.detach_all();
        }
    }

    fn spawn_all(&self) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for id in &self.to_run {
            let state = Arc::clone(&self.state);
            let id = id.clone();
            tasks.spawn(async move { drive(state, id).await });
        }
        tasks
    }

    /// After a timeout: signal cancellation, give waiting tasks a moment to
    /// record `Cancelled`, then leave anything still running behind.
    async fn cancel_pending(&self, tasks: &mut JoinSet<()>) {
        self.state.cancel.send_replace(true);
        let grace = Duration::from_millis(100);
        let _ = tokio::time::timeout(grace, async {
            let records = &self.state;
            loop {
                let pending = records
                    .snapshot()
                    .values()
                    .any(|r| matches!(r.status, ActionStatus::Waiting | ActionStatus::Ready));
                if !pending {
                    break;
                }
                match tasks.join_next().await {
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
    }

    fn build_report(&self, timed_out: bool) -> SchedulerReport {
        let snapshot = self.state.snapshot();
        let failed = snapshot
            .values()
            .any(|r| r.status != ActionStatus::Done);
        let code = if timed_out || failed {
            CastleReturnCode::ToolFailed
        } else {
            CastleReturnCode::Success
        };
        let manager = self.state.cluster.shutdown_manager();
        manager.change_return_code(code);
        SchedulerReport {
            records: snapshot
                .into_iter()
                .map(|(id, record)| (id.to_string(), record))
                .collect(),
            timed_out,
            return_code: manager.return_code(),
        }
    }
}

impl Drop for ActionScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Per-action task
// ---------------------------------------------------------------------------

async fn drive(state: Arc<RunState>, id: ActionId) {
    let mut cancel = state.cancel.subscribe();

    for pred in state.graph.predecessors_of(&id) {
        let Some(signal) = state.signals.get(pred) else {
            // Predecessors outside the closure are not part of this run.
            continue;
        };
        let mut rx = signal.subscribe();
        let completion = tokio::select! {
            res = rx.wait_for(Option::is_some) => match res {
                Ok(value) => *value,
                Err(_) => Some(Completion::NotDone),
            },
            _ = cancel.wait_for(|c| *c) => {
                state.finish(&id, ActionStatus::Cancelled, None);
                return;
            }
        };
        if completion != Some(Completion::Done) {
            tracing::warn!(action = %id, blocked_by = %pred, "skipping action: dependency did not complete");
            state.finish(
                &id,
                ActionStatus::Skipped {
                    blocked_by: pred.to_string(),
                },
                None,
            );
            return;
        }
    }

    state.set_status(&id, ActionStatus::Ready);

    let Some(action) = state.graph.action(&id).cloned() else {
        state.finish(
            &id,
            ActionStatus::Failed {
                cause: format!("action {id} is not in the graph"),
            },
            None,
        );
        return;
    };

    let delay = action.initial_delay();
    if !delay.is_zero() {
        tracing::debug!(action = %id, delay_ms = delay.as_millis() as u64, "waiting before start");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.wait_for(|c| *c) => {
                state.finish(&id, ActionStatus::Cancelled, None);
                return;
            }
        }
    }
    if *cancel.borrow() {
        state.finish(&id, ActionStatus::Cancelled, None);
        return;
    }

    state.mark_running(&id);
    tracing::info!(action = %id, "running action");
    let started = Instant::now();
    let cluster = Arc::clone(&state.cluster);
    let scope = id.scope().to_string();
    let joined = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let node = cluster
            .node(&scope)
            .ok_or_else(|| CastleError::UnknownNode(scope.clone()))?;
        action.call(&cluster, node)
    })
    .await;
    let elapsed = Some(started.elapsed());

    let status = match joined {
        Ok(Ok(())) => {
            tracing::info!(action = %id, elapsed_ms = started.elapsed().as_millis() as u64, "action finished");
            ActionStatus::Done
        }
        Ok(Err(e)) => {
            tracing::error!(action = %id, "action failed: {e:?}");
            ActionStatus::Failed {
                cause: format!("{e:#}"),
            }
        }
        Err(e) => {
            tracing::error!(action = %id, "action panicked: {e}");
            ActionStatus::Failed {
                cause: format!("panic: {e}"),
            }
        }
    };
    state.finish(&id, status, elapsed);
}

mod duration_ms_opt {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(dur) => s.serialize_some(&(dur.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_cluster, TestAction};
    use std::sync::atomic::{AtomicBool, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn dependencies_run_first() {
        let (_dir, cluster) = test_cluster();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = ActionScheduler::builder(Arc::new(cluster))
            .add_target_names(["c"])
            .add_actions(vec![
                TestAction::new("a", "node0").records(journal.clone()).build(),
                TestAction::new("b", "node0")
                    .comes_after(&["a"])
                    .records(journal.clone())
                    .build(),
                TestAction::new("c", "node1")
                    .targets(vec![TargetId::all("b")])
                    .records(journal.clone())
                    .build(),
                TestAction::new("unrelated", "node2").records(journal.clone()).build(),
            ])
            .build()
            .unwrap();
        let report = scheduler.await_completion(TIMEOUT).await;
        assert!(report.all_done());
        assert_eq!(report.return_code, CastleReturnCode::Success);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["a:node0", "b:node0", "c:node1"]
        );
        assert!(report.records["c:node1"].elapsed.is_some());
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_other_branches() {
        let (_dir, cluster) = test_cluster();
        let cluster = Arc::new(cluster);
        let mut scheduler = ActionScheduler::builder(Arc::clone(&cluster))
            .add_target_names(["b", "c"])
            .add_actions(vec![
                TestAction::new("a", "node0").fails("disk on fire").build(),
                TestAction::new("b", "node0").comes_after(&["a"]).build(),
                TestAction::new("c", "node1").build(),
            ])
            .build()
            .unwrap();
        let report = scheduler.await_completion(TIMEOUT).await;
        match report.status_of(&ActionId::new("a", "node0")) {
            Some(ActionStatus::Failed { cause }) => assert!(cause.contains("disk on fire")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(
            report.status_of(&ActionId::new("b", "node0")),
            Some(&ActionStatus::Skipped {
                blocked_by: "a:node0".to_string()
            })
        );
        assert_eq!(
            report.status_of(&ActionId::new("c", "node1")),
            Some(&ActionStatus::Done)
        );
        assert_eq!(report.return_code, CastleReturnCode::ToolFailed);
        assert_eq!(
            cluster.shutdown_manager().return_code(),
            CastleReturnCode::ToolFailed
        );
    }

    #[tokio::test]
    async fn skips_propagate_across_nodes() {
        let (_dir, cluster) = test_cluster();
        let mut scheduler = ActionScheduler::builder(Arc::new(cluster))
            .add_target_names(["z", "w"])
            .add_actions(vec![
                TestAction::new("x", "node1").fails("no space left").build(),
                TestAction::new("y", "node1").comes_after(&["x"]).build(),
                TestAction::new("z", "node3")
                    .targets(vec![TargetId::new("y", "node1")])
                    .build(),
                TestAction::new("w", "node0").build(),
                TestAction::new("w", "node2").build(),
                TestAction::new("w", "node3").build(),
            ])
            .build()
            .unwrap();
        let report = scheduler.await_completion(TIMEOUT).await;
        assert!(matches!(
            report.status_of(&ActionId::new("x", "node1")),
            Some(ActionStatus::Failed { .. })
        ));
        assert_eq!(
            report.status_of(&ActionId::new("y", "node1")),
            Some(&ActionStatus::Skipped {
                blocked_by: "x:node1".to_string()
            })
        );
        assert_eq!(
            report.status_of(&ActionId::new("z", "node3")),
            Some(&ActionStatus::Skipped {
                blocked_by: "y:node1".to_string()
            })
        );
        for node in ["node0", "node2", "node3"] {
            assert_eq!(
                report.status_of(&ActionId::new("w", node)),
                Some(&ActionStatus::Done),
                "w:{node}"
            );
        }
        assert_eq!(report.return_code, CastleReturnCode::ToolFailed);
    }

    #[tokio::test]
    async fn timeout_cancels_waiting_actions() {
        let (_dir, cluster) = test_cluster();
        let gate = Arc::new(AtomicBool::new(false));
        let mut scheduler = ActionScheduler::builder(Arc::new(cluster))
            .add_target_names(["b"])
            .add_actions(vec![
                TestAction::new("a", "node0").blocks_until(gate.clone()).build(),
                TestAction::new("b", "node0").comes_after(&["a"]).build(),
            ])
            .build()
            .unwrap();
        let report = scheduler.await_completion(Duration::from_millis(200)).await;
        gate.store(true, Ordering::SeqCst);
        assert!(report.timed_out);
        assert!(!report.all_done());
        assert_eq!(
            report.status_of(&ActionId::new("a", "node0")),
            Some(&ActionStatus::Running)
        );
        assert_eq!(
            report.status_of(&ActionId::new("b", "node0")),
            Some(&ActionStatus::Cancelled)
        );
        assert_eq!(report.return_code, CastleReturnCode::ToolFailed);

        let again = scheduler.await_completion(TIMEOUT).await;
        assert!(again.timed_out);
    }

    #[tokio::test]
    async fn initial_delay_is_observed() {
        let (_dir, cluster) = test_cluster();
        let mut scheduler = ActionScheduler::builder(Arc::new(cluster))
            .add_target_names(["slow"])
            .add_actions(vec![TestAction::new("slow", "node0").delay_ms(100).build()])
            .build()
            .unwrap();
        let started = Instant::now();
        let report = scheduler.await_completion(TIMEOUT).await;
        assert!(report.all_done());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn index_scopes_are_translated() {
        let (_dir, cluster) = test_cluster();
        let scheduler = ActionScheduler::builder(Arc::new(cluster))
            .add_target_names(["a:1"])
            .add_actions(vec![
                TestAction::new("a", "node0").build(),
                TestAction::new("a", "node1").build(),
            ])
            .build()
            .unwrap();
        assert_eq!(
            scheduler.action_ids().iter().collect::<Vec<_>>(),
            vec![&ActionId::new("a", "node1")]
        );
    }

    #[test]
    fn unknown_targets_and_nodes_fail_the_build() {
        let (_dir, cluster) = test_cluster();
        let cluster = Arc::new(cluster);
        let err = ActionScheduler::builder(Arc::clone(&cluster))
            .add_target_names(["bogus"])
            .add_actions(vec![TestAction::new("a", "node0").build()])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CastleError::UnknownTarget(ref t) if t == "bogus"));

        let err = ActionScheduler::builder(cluster)
            .add_target_names(["a"])
            .add_actions(vec![TestAction::new("a", "node9").build()])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CastleError::UnknownNode(_)));
    }
}
