use std::collections::HashMap;
use std::future::pending;

use eltflow_utils::error::Error;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::dag::node::{NodeKind, NodeOutput, TaskInputs, TaskNode};
use crate::dag::resolver::{Plan, PlannedNode};
use crate::scheduler::report::RunReport;
use crate::scheduler::sensor::{self, SensorState};
use crate::scheduler::state::{NodeOutcome, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Nodes in flight at once across the whole run.
    pub max_active_tasks: usize,
    /// Cancel every pending node after the first failure.
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: 16,
            fail_fast: false,
        }
    }
}

/// Result of a single node execution, sent back to the executor loop.
struct Finished {
    node: String,
    outcome: NodeOutcome,
}

/// Walks a [`Plan`] once, dispatching ready nodes within the concurrency
/// budgets and routing outputs to consumers.
#[derive(Debug, Clone)]
pub struct Executor {
    pipeline: String,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(pipeline: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            pipeline: pipeline.into(),
            config,
        }
    }

    pub async fn run(&self, plan: &Plan) -> RunReport {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(plan, cancel_rx).await
    }

    /// Run until every node is terminal. Setting the watch to `true` lets
    /// running nodes finish their current attempt and cancels the rest.
    pub async fn run_with_cancel(&self, plan: &Plan, cancel: watch::Receiver<bool>) -> RunReport {
        self.run_with_id(Uuid::new_v4().to_string(), plan, cancel).await
    }

    /// As [`Executor::run_with_cancel`], under a caller-chosen run id.
    pub async fn run_with_id(&self, run_id: String, plan: &Plan, mut cancel: watch::Receiver<bool>) -> RunReport {
        let mut state = RunState::new(run_id.clone(), self.pipeline.clone(), plan);
        let (result_tx, mut result_rx) = mpsc::channel::<Finished>(plan.len().max(1));
        let global_limit = self.config.max_active_tasks.max(1);

        let mut running = 0usize;
        let mut per_group: HashMap<String, usize> = HashMap::new();
        let mut cancelled = *cancel.borrow();
        let mut cancel_open = true;

        tracing::info!(run = %run_id, pipeline = %self.pipeline, nodes = plan.len(), "pipeline run started");
        if cancelled {
            state.cancel_pending();
        }

        loop {
            if !cancelled {
                for id in state.ready_nodes(plan) {
                    if running >= global_limit {
                        break;
                    }
                    let Some(planned) = plan.node(&id) else { continue };
                    if let Some(group) = &planned.group {
                        let limit = plan.group(group).and_then(|g| g.max_active_tasks);
                        let in_flight = per_group.get(group).copied().unwrap_or(0);
                        if limit.is_some_and(|limit| in_flight >= limit) {
                            continue;
                        }
                        *per_group.entry(group.clone()).or_default() += 1;
                    }
                    if !state.mark_running(&id) {
                        continue;
                    }
                    running += 1;
                    let inputs = state.inputs_for(plan, &id);
                    dispatch(&run_id, planned, inputs, cancel.clone(), result_tx.clone());
                }
            }

            if running == 0 {
                break;
            }

            tokio::select! {
                Some(finished) = result_rx.recv() => {
                    running -= 1;
                    if let Some(group) = plan.node(&finished.node).and_then(|n| n.group.as_ref()) {
                        if let Some(count) = per_group.get_mut(group) {
                            *count = count.saturating_sub(1);
                        }
                    }

                    let outcome = &finished.outcome;
                    let failed = match &outcome.result {
                        Ok(_) => {
                            tracing::info!(
                                run = %run_id,
                                node = %finished.node,
                                attempts = outcome.attempts,
                                duration_ms = outcome.duration.as_millis() as u64,
                                "node succeeded"
                            );
                            false
                        }
                        Err(Error::Cancelled) => {
                            tracing::info!(run = %run_id, node = %finished.node, "node cancelled");
                            false
                        }
                        Err(e) => {
                            tracing::error!(
                                run = %run_id,
                                node = %finished.node,
                                attempts = outcome.attempts,
                                error = %e,
                                "node failed"
                            );
                            true
                        }
                    };

                    for skipped in state.complete(plan, &finished.node, finished.outcome) {
                        tracing::warn!(run = %run_id, node = %skipped, upstream = %finished.node, "upstream failed, node will not run");
                    }

                    if failed && self.config.fail_fast && !cancelled {
                        cancelled = true;
                        let n = state.cancel_pending().len();
                        tracing::warn!(run = %run_id, cancelled = n, "fail-fast: cancelled pending nodes");
                    }
                }
                changed = cancel.changed(), if cancel_open && !cancelled => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            cancelled = true;
                            let n = state.cancel_pending().len();
                            tracing::warn!(run = %run_id, cancelled = n, running, "run cancelled, waiting for running nodes");
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }

        // Nodes stranded behind a cancelled upstream.
        if !state.is_complete() {
            state.cancel_pending();
        }

        let report = state.into_report(plan, cancelled);
        tracing::info!(
            run = %report.run_id,
            pipeline = %report.pipeline,
            success = report.success,
            failures = report.failures().len(),
            duration_ms = report.duration_ms(),
            "pipeline run finished"
        );
        report
    }
}

/// Spawn a node on its own task. A panic inside the node becomes a task error.
fn dispatch(
    run_id: &str,
    planned: &PlannedNode,
    inputs: TaskInputs,
    cancel: watch::Receiver<bool>,
    result_tx: mpsc::Sender<Finished>,
) {
    let id = planned.id.clone();
    let node = planned.node.clone();
    let span = tracing::info_span!("node", run = %run_id, node = %id);
    tracing::debug!(run = %run_id, node = %id, "dispatching node");

    tokio::spawn(async move {
        let start = Instant::now();
        let handle = tokio::spawn(execute_node(id.clone(), node, inputs, cancel).instrument(span));
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => NodeOutcome {
                result: Err(Error::task(format!("node panicked: {e}"))),
                attempts: 1,
                duration: start.elapsed(),
                sensor: None,
            },
        };
        let _ = result_tx.send(Finished { node: id, outcome }).await;
    });
}

async fn execute_node(
    id: String,
    node: TaskNode,
    inputs: TaskInputs,
    mut cancel: watch::Receiver<bool>,
) -> NodeOutcome {
    let start = Instant::now();

    let task = match &node.kind {
        NodeKind::Sensor { sensor, config } => {
            let (result, state) = match sensor::wait_for(&id, sensor.as_ref(), *config, &mut cancel).await {
                Ok(outcome) => (Ok(NodeOutput::Flag(true)), outcome.state),
                Err(e @ Error::SensorTimeout { .. }) => (Err(e), SensorState::TimedOut),
                Err(e) => (Err(e), SensorState::Waiting),
            };
            return NodeOutcome {
                result,
                attempts: 1,
                duration: start.elapsed(),
                sensor: Some(state),
            };
        }
        NodeKind::Task(task) => task.clone(),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let run = task.run(inputs.clone());
        let result = match node.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(Error::TaskTimeout(limit)),
            },
            None => run.await,
        };

        let err = match result {
            Ok(output) => {
                return NodeOutcome {
                    result: Ok(output),
                    attempts: attempt,
                    duration: start.elapsed(),
                    sensor: None,
                }
            }
            Err(err) => err,
        };

        if *cancel.borrow() || !node.retry.should_retry(attempt, &err) {
            return NodeOutcome {
                result: Err(err),
                attempts: attempt,
                duration: start.elapsed(),
                sensor: None,
            };
        }

        let delay = node.retry.delay_for(attempt);
        tracing::warn!(
            attempt,
            max_attempts = node.retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut cancel) => {
                return NodeOutcome {
                    result: Err(err),
                    attempts: attempt,
                    duration: start.elapsed(),
                    sensor: None,
                };
            }
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::graph::DependencyGraph;
    use crate::dag::group::TaskGroup;
    use crate::dag::node::task_fn;
    use crate::scheduler::retry::RetryPolicy;
    use crate::scheduler::state::NodeState;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A node that sleeps, tracking how many instances are in flight.
    fn sleeper(name: &str, secs: u64, live: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> TaskNode {
        TaskNode::task(
            name,
            task_fn(move |_| {
                let live = live.clone();
                let peak = peak.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(NodeOutput::Empty)
                }
            }),
        )
    }

    fn counting(name: &str, calls: Arc<AtomicU32>) -> TaskNode {
        TaskNode::task(
            name,
            task_fn(move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(NodeOutput::Empty)
                }
            }),
        )
    }

    fn failing(name: &str) -> TaskNode {
        TaskNode::task(name, task_fn(|_| async { Err(Error::connector("api", "HTTP 503")) }))
    }

    #[tokio::test]
    async fn outputs_flow_along_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_node(TaskNode::task("fetch", task_fn(|_| async { Ok(NodeOutput::Text("42".into())) })));
        graph.add_node(TaskNode::task(
            "double",
            task_fn(|inputs: TaskInputs| async move {
                let Some(NodeOutput::Text(v)) = inputs.get("fetch") else {
                    return Err(Error::task("missing fetch"));
                };
                let n: i64 = v.parse().map_err(|e| Error::task(e))?;
                Ok(NodeOutput::Text((n * 2).to_string()))
            }),
        ));
        graph.add_edge("fetch", "double");
        let plan = graph.validate().unwrap();

        let report = Executor::new("test", ExecutorConfig::default()).run(&plan).await;
        assert!(report.success, "{}", report.summary());
        assert_eq!(report.state_of("double"), Some(NodeState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_bounds_in_flight_nodes() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        for name in ["a", "b", "c", "d"] {
            graph.add_node(sleeper(name, 10, live.clone(), peak.clone()));
        }
        let plan = graph.validate().unwrap();

        let start = Instant::now();
        let config = ExecutorConfig { max_active_tasks: 2, ..Default::default() };
        let report = Executor::new("test", config).run(&plan).await;

        assert!(report.success);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn group_budget_serializes_members() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut graph = DependencyGraph::new();
        let mut group = TaskGroup::new("load").max_active_tasks(1);
        for name in ["x", "y", "z"] {
            group.add_node(sleeper(name, 5, live.clone(), peak.clone()));
        }
        graph.add_group(group);
        let plan = graph.validate().unwrap();

        let start = Instant::now();
        let report = Executor::new("test", ExecutorConfig::default()).run(&plan).await;
        assert!(report.success);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert_eq!(report.group_state("load"), Some(NodeState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = TaskNode::task(
            "flaky",
            task_fn(move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::connector("api", "HTTP 502"))
                    } else {
                        Ok(NodeOutput::Empty)
                    }
                }
            }),
        )
        .retry(RetryPolicy::exponential(2, Duration::from_secs(10)));

        let mut graph = DependencyGraph::new();
        graph.add_node(flaky);
        let plan = graph.validate().unwrap();

        let start = Instant::now();
        let report = Executor::new("test", ExecutorConfig::default()).run(&plan).await;
        assert!(report.success);
        assert_eq!(report.node("flaky").unwrap().attempts, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_fails_node() {
        let slow = TaskNode::task(
            "slow",
            task_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(NodeOutput::Empty)
            }),
        )
        .timeout(Duration::from_secs(10));

        let mut graph = DependencyGraph::new();
        graph.add_node(slow);
        let report = Executor::new("test", ExecutorConfig::default())
            .run(&graph.validate().unwrap())
            .await;

        let node = report.node("slow").unwrap();
        assert_eq!(node.state, NodeState::Failed);
        assert_eq!(node.error_kind.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn failure_poisons_downstream_but_not_siblings() {
        let downstream_calls = Arc::new(AtomicU32::new(0));
        let sibling_calls = Arc::new(AtomicU32::new(0));

        let mut graph = DependencyGraph::new();
        graph.add_node(failing("extract"));
        graph.add_node(counting("load", downstream_calls.clone()));
        graph.add_node(counting("transform", downstream_calls.clone()));
        graph.add_node(counting("other", sibling_calls.clone()));
        graph.add_edge("extract", "load").add_edge("load", "transform");
        let plan = graph.validate().unwrap();

        let report = Executor::new("test", ExecutorConfig::default()).run(&plan).await;
        assert!(!report.success);
        assert_eq!(report.state_of("extract"), Some(NodeState::Failed));
        assert_eq!(report.state_of("load"), Some(NodeState::UpstreamFailed));
        assert_eq!(report.state_of("transform"), Some(NodeState::UpstreamFailed));
        assert_eq!(report.state_of("other"), Some(NodeState::Succeeded));
        assert_eq!(downstream_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sibling_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.root_causes().len(), 1);
    }

    #[tokio::test]
    async fn panicking_node_is_reported_as_failure() {
        let mut graph = DependencyGraph::new();
        graph.add_node(TaskNode::task(
            "boom",
            task_fn(|_| async {
                if true {
                    panic!("bad row");
                }
                Ok(NodeOutput::Empty)
            }),
        ));
        let report = Executor::new("test", ExecutorConfig::default())
            .run(&graph.validate().unwrap())
            .await;
        assert_eq!(report.state_of("boom"), Some(NodeState::Failed));
        assert!(report.node("boom").unwrap().error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_running_finish_and_cancels_pending() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let after_calls = Arc::new(AtomicU32::new(0));

        let mut graph = DependencyGraph::new();
        graph.add_node(sleeper("long", 10, live, peak));
        graph.add_node(counting("after", after_calls.clone()));
        graph.add_edge("long", "after");
        let plan = graph.validate().unwrap();

        let (tx, rx) = watch::channel(false);
        let executor = Executor::new("test", ExecutorConfig::default());
        let run = tokio::spawn(async move { executor.run_with_cancel(&plan, rx).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        let report = run.await.unwrap();

        assert!(report.cancelled);
        assert!(!report.success);
        assert_eq!(report.state_of("long"), Some(NodeState::Succeeded));
        assert_eq!(report.state_of("after"), Some(NodeState::Cancelled));
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fail_fast_cancels_remaining_work() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut graph = DependencyGraph::new();
        graph.add_node(failing("first"));
        graph.add_node(counting("gate", calls.clone()));
        graph.add_node(counting("second", calls.clone()));
        graph.add_edge("gate", "second");
        let plan = graph.validate().unwrap();

        let config = ExecutorConfig { max_active_tasks: 1, fail_fast: true };
        let report = Executor::new("test", config).run(&plan).await;
        assert_eq!(report.state_of("first"), Some(NodeState::Failed));
        assert_eq!(report.state_of("gate"), Some(NodeState::Cancelled));
        assert_eq!(report.state_of("second"), Some(NodeState::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
