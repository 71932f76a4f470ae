use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::sensor::SensorState;
use crate::scheduler::state::NodeState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub group: Option<String>,
    pub state: NodeState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    /// The node's own error when it failed, or the failing upstream otherwise.
    pub root_cause: Option<String>,
    pub sensor: Option<SensorState>,
}

/// Terminal view of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Nodes in topological order.
    pub nodes: Vec<NodeReport>,
    pub success: bool,
    pub cancelled: bool,
}

impl RunReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.node(id).map(|n| n.state)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Every failed or upstream-failed node.
    pub fn failures(&self) -> Vec<&NodeReport> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.state, NodeState::Failed | NodeState::UpstreamFailed))
            .collect()
    }

    /// Nodes that failed on their own.
    pub fn root_causes(&self) -> Vec<&NodeReport> {
        self.nodes.iter().filter(|n| n.state == NodeState::Failed).collect()
    }

    /// Aggregate state of a group: succeeded only when every member succeeded.
    pub fn group_state(&self, group: &str) -> Option<NodeState> {
        let members: Vec<NodeState> = self
            .nodes
            .iter()
            .filter(|n| n.group.as_deref() == Some(group))
            .map(|n| n.state)
            .collect();
        if members.is_empty() {
            return None;
        }
        if members.iter().all(|s| *s == NodeState::Succeeded) {
            return Some(NodeState::Succeeded);
        }
        [
            NodeState::Failed,
            NodeState::UpstreamFailed,
            NodeState::Cancelled,
            NodeState::Running,
            NodeState::Pending,
        ]
        .into_iter()
        .find(|s| members.contains(s))
    }

    pub fn summary(&self) -> String {
        let outcome = if self.success {
            "succeeded"
        } else if self.cancelled {
            "cancelled"
        } else {
            "failed"
        };
        let mut out = format!(
            "run {} of `{}` {} in {}ms\n",
            self.run_id,
            self.pipeline,
            outcome,
            self.duration_ms()
        );
        for node in &self.nodes {
            let _ = write!(out, "  {:<48} {:<16} attempts={}", node.id, node.state, node.attempts);
            if let Some(ms) = node.duration_ms {
                let _ = write!(out, " {ms}ms");
            }
            out.push('\n');
            if let Some(cause) = &node.root_cause {
                let _ = writeln!(out, "      cause: {cause}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, group: Option<&str>, state: NodeState) -> NodeReport {
        NodeReport {
            id: id.into(),
            group: group.map(String::from),
            state,
            attempts: 1,
            started_at: None,
            duration_ms: Some(3),
            error: None,
            error_kind: None,
            root_cause: (state == NodeState::Failed).then(|| "Task Error: boom".to_string()),
            sensor: None,
        }
    }

    fn report(nodes: Vec<NodeReport>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: "r1".into(),
            pipeline: "p".into(),
            started_at: now,
            finished_at: now,
            success: nodes.iter().all(|n| n.state == NodeState::Succeeded),
            nodes,
            cancelled: false,
        }
    }

    #[test]
    fn group_state_aggregates_members() {
        let report = report(vec![
            node("load.a", Some("load"), NodeState::Succeeded),
            node("load.b", Some("load"), NodeState::UpstreamFailed),
            node("dbt.run", Some("dbt"), NodeState::Succeeded),
        ]);
        assert_eq!(report.group_state("load"), Some(NodeState::UpstreamFailed));
        assert_eq!(report.group_state("dbt"), Some(NodeState::Succeeded));
        assert_eq!(report.group_state("missing"), None);
    }

    #[test]
    fn failures_and_summary_name_root_cause() {
        let report = report(vec![
            node("a", None, NodeState::Failed),
            node("b", None, NodeState::UpstreamFailed),
            node("c", None, NodeState::Succeeded),
        ]);
        assert_eq!(report.failures().len(), 2);
        assert_eq!(report.root_causes().len(), 1);

        let summary = report.summary();
        assert!(summary.contains("failed"));
        assert!(summary.contains("cause: Task Error: boom"));
    }
}
