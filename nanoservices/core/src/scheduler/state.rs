use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eltflow_utils::error::Error;
use eltflow_utils::EltResult;
use serde::{Deserialize, Serialize};

use crate::dag::node::{NodeOutput, TaskInputs};
use crate::dag::resolver::Plan;
use crate::scheduler::report::{NodeReport, RunReport};
use crate::scheduler::sensor::SensorState;

/// State of one node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Running)
    }

    /// Transitions are monotonic; terminal states never change.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, UpstreamFailed)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Running => "RUNNING",
            NodeState::Succeeded => "SUCCEEDED",
            NodeState::Failed => "FAILED",
            NodeState::UpstreamFailed => "UPSTREAM_FAILED",
            NodeState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a dispatched node sends back to the executor loop.
#[derive(Debug)]
pub struct NodeOutcome {
    pub result: EltResult<NodeOutput>,
    pub attempts: u32,
    pub duration: Duration,
    pub sensor: Option<SensorState>,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub state: NodeState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub root_cause: Option<String>,
    pub sensor: Option<SensorState>,
}

impl NodeRecord {
    fn new(is_sensor: bool) -> Self {
        Self {
            state: NodeState::Pending,
            attempts: 0,
            started_at: None,
            duration: None,
            error: None,
            error_kind: None,
            root_cause: None,
            sensor: is_sensor.then_some(SensorState::Waiting),
        }
    }
}

/// In-memory state for a single pipeline run. Only the executor loop writes to it.
#[derive(Debug)]
pub struct RunState {
    pub id: String,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    records: HashMap<String, NodeRecord>,
    outputs: HashMap<String, NodeOutput>,
}

impl RunState {
    pub fn new(id: String, pipeline: String, plan: &Plan) -> Self {
        let records = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeRecord::new(n.node.is_sensor())))
            .collect();
        Self {
            id,
            pipeline,
            started_at: Utc::now(),
            records,
            outputs: HashMap::new(),
        }
    }

    pub fn state(&self, id: &str) -> Option<NodeState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn record(&self, id: &str) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    pub fn output(&self, id: &str) -> Option<&NodeOutput> {
        self.outputs.get(id)
    }

    fn transition(&mut self, id: &str, next: NodeState) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if !record.state.can_transition_to(next) {
            tracing::warn!(run = %self.id, node = id, from = %record.state, to = %next, "ignored invalid state transition");
            return false;
        }
        record.state = next;
        true
    }

    /// Pending nodes whose upstreams all succeeded, in plan order.
    pub fn ready_nodes(&self, plan: &Plan) -> Vec<String> {
        plan.order
            .iter()
            .filter(|id| self.state(id) == Some(NodeState::Pending))
            .filter(|id| {
                plan.dependencies
                    .get(*id)
                    .map(|deps| deps.iter().all(|d| self.state(d) == Some(NodeState::Succeeded)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn mark_running(&mut self, id: &str) -> bool {
        if !self.transition(id, NodeState::Running) {
            return false;
        }
        if let Some(record) = self.records.get_mut(id) {
            record.started_at = Some(Utc::now());
        }
        true
    }

    /// Outputs of `id`'s producers, keyed as the node expects them.
    pub fn inputs_for(&self, plan: &Plan, id: &str) -> TaskInputs {
        plan.node(id)
            .map(|planned| {
                planned
                    .inputs
                    .iter()
                    .filter_map(|(key, producer)| {
                        self.outputs.get(producer).map(|out| (key.clone(), out.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a finished node. Returns the dependents poisoned by a failure.
    pub fn complete(&mut self, plan: &Plan, id: &str, outcome: NodeOutcome) -> Vec<String> {
        if let Some(record) = self.records.get_mut(id) {
            record.attempts = outcome.attempts;
            record.duration = Some(outcome.duration);
            if outcome.sensor.is_some() {
                record.sensor = outcome.sensor;
            }
        }

        match outcome.result {
            Ok(output) => {
                if self.transition(id, NodeState::Succeeded) {
                    self.outputs.insert(id.to_string(), output);
                }
                Vec::new()
            }
            Err(Error::Cancelled) => {
                if self.transition(id, NodeState::Cancelled) {
                    if let Some(record) = self.records.get_mut(id) {
                        record.error = Some(Error::Cancelled.to_string());
                        record.error_kind = Some(Error::Cancelled.kind());
                    }
                }
                Vec::new()
            }
            Err(err) => {
                if !self.transition(id, NodeState::Failed) {
                    return Vec::new();
                }
                if let Some(record) = self.records.get_mut(id) {
                    record.error = Some(err.to_string());
                    record.error_kind = Some(err.kind());
                    record.root_cause = Some(err.to_string());
                }
                self.poison(plan, id, &err)
            }
        }
    }

    /// Mark every pending node reachable from `failed` as upstream-failed.
    fn poison(&mut self, plan: &Plan, failed: &str, err: &Error) -> Vec<String> {
        let cause = format!("upstream `{failed}` failed: {err}");
        let mut poisoned = Vec::new();
        let mut queue: VecDeque<&String> = plan.dependents.get(failed).into_iter().flatten().collect();

        while let Some(next) = queue.pop_front() {
            if !self.transition(next, NodeState::UpstreamFailed) {
                continue;
            }
            if let Some(record) = self.records.get_mut(next.as_str()) {
                record.root_cause = Some(cause.clone());
            }
            poisoned.push(next.clone());
            queue.extend(plan.dependents.get(next).into_iter().flatten());
        }

        poisoned.sort_by_key(|id| plan.position(id));
        poisoned
    }

    /// Mark every pending node cancelled. Running nodes are left alone.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        let pending: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.state == NodeState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &pending {
            self.transition(id, NodeState::Cancelled);
        }
        pending
    }

    pub fn is_complete(&self) -> bool {
        self.records.values().all(|r| r.state.is_terminal())
    }

    pub fn into_report(self, plan: &Plan, cancelled: bool) -> RunReport {
        let mut records = self.records;
        let nodes = plan
            .order
            .iter()
            .filter_map(|id| {
                let record = records.remove(id)?;
                Some(NodeReport {
                    id: id.clone(),
                    group: plan.node(id).and_then(|n| n.group.clone()),
                    state: record.state,
                    attempts: record.attempts,
                    started_at: record.started_at,
                    duration_ms: record.duration.map(|d| d.as_millis() as u64),
                    error: record.error,
                    error_kind: record.error_kind.map(String::from),
                    root_cause: record.root_cause,
                    sensor: record.sensor,
                })
            })
            .collect::<Vec<_>>();

        let success = !cancelled && nodes.iter().all(|n| n.state == NodeState::Succeeded);
        RunReport {
            run_id: self.id,
            pipeline: self.pipeline,
            started_at: self.started_at,
            finished_at: Utc::now(),
            nodes,
            success,
            cancelled,
        }
    }
}
