use crate::dag::graph::EdgeKind;
use crate::dag::node::TaskNode;

/// A named subgraph presented to the rest of the graph as one composite node.
///
/// Members are addressed by their local name inside the group only. From the
/// outside the group is reachable through:
/// - `Endpoint::Group`, meaning the whole group (completion only),
/// - `Endpoint::Port` on a declared input or output port.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    name: String,
    tooltip: Option<String>,
    nodes: Vec<TaskNode>,
    edges: Vec<(String, String, EdgeKind)>,
    inputs: Vec<(String, String)>,
    outputs: Vec<(String, String)>,
    max_active_tasks: Option<usize>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tooltip: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            max_active_tasks: None,
        }
    }

    pub fn tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = Some(tooltip.into());
        self
    }

    /// Concurrency budget shared by all members of this group.
    pub fn max_active_tasks(mut self, limit: usize) -> Self {
        self.max_active_tasks = Some(limit.max(1));
        self
    }

    pub fn add_node(&mut self, node: TaskNode) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Internal edge: `consumer` waits for `producer` and receives its output
    /// under the producer's local name.
    pub fn add_edge(&mut self, producer: impl Into<String>, consumer: impl Into<String>) -> &mut Self {
        self.edges.push((producer.into(), consumer.into(), EdgeKind::Data));
        self
    }

    /// Internal edge that only orders the two nodes.
    pub fn add_completion_edge(
        &mut self,
        producer: impl Into<String>,
        consumer: impl Into<String>,
    ) -> &mut Self {
        self.edges.push((producer.into(), consumer.into(), EdgeKind::Completion));
        self
    }

    /// Route data arriving on `port` to the member `node`. A port may feed
    /// several members.
    pub fn expose_input(&mut self, port: impl Into<String>, node: impl Into<String>) -> &mut Self {
        self.inputs.push((port.into(), node.into()));
        self
    }

    /// Publish the output of member `node` as `port`.
    pub fn expose_output(&mut self, port: impl Into<String>, node: impl Into<String>) -> &mut Self {
        self.outputs.push((port.into(), node.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tooltip_text(&self) -> Option<&str> {
        self.tooltip.as_deref()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[(String, String, EdgeKind)] {
        &self.edges
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.max_active_tasks
    }

    pub fn contains(&self, local: &str) -> bool {
        self.nodes.iter().any(|n| n.name == local)
    }

    /// Members fed by input `port`.
    pub fn input_targets(&self, port: &str) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|(p, _)| p == port)
            .map(|(_, node)| node.as_str())
            .collect()
    }

    /// Member exposed as output `port`.
    pub fn output_source(&self, port: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(p, _)| p == port)
            .map(|(_, node)| node.as_str())
    }

    pub fn input_ports(&self) -> &[(String, String)] {
        &self.inputs
    }

    pub fn output_ports(&self) -> &[(String, String)] {
        &self.outputs
    }

    /// Qualified id of a member as it appears in plans and reports.
    pub fn qualify(&self, local: &str) -> String {
        format!("{}.{}", self.name, local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::node::{task_fn, NodeOutput};

    fn noop(name: &str) -> TaskNode {
        TaskNode::task(name, task_fn(|_| async { Ok(NodeOutput::Empty) }))
    }

    #[test]
    fn ports_resolve_to_members() {
        let mut group = TaskGroup::new("load").tooltip("Load raw data");
        group
            .add_node(noop("load_orders"))
            .add_node(noop("audit"))
            .expose_input("orders", "load_orders")
            .expose_input("orders", "audit")
            .expose_output("orders_table", "load_orders");

        assert_eq!(group.input_targets("orders"), vec!["load_orders", "audit"]);
        assert_eq!(group.output_source("orders_table"), Some("load_orders"));
        assert_eq!(group.output_source("missing"), None);
        assert_eq!(group.qualify("audit"), "load.audit");
        assert_eq!(group.tooltip_text(), Some("Load raw data"));
    }

    #[test]
    fn concurrency_budget_is_at_least_one() {
        let group = TaskGroup::new("g").max_active_tasks(0);
        assert_eq!(group.concurrency(), Some(1));
    }
}
