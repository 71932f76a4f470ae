use std::collections::{BTreeSet, HashMap, HashSet};

use crate::dag::graph::{DagError, DependencyGraph, EdgeKind, Endpoint};
use crate::dag::group::TaskGroup;
use crate::dag::node::TaskNode;

/// A concrete node of a validated plan.
#[derive(Debug, Clone)]
pub struct PlannedNode {
    /// Top-level name, or `group.local` for group members.
    pub id: String,
    pub group: Option<String>,
    pub node: TaskNode,
    /// `(input key, producer id)` pairs routed into the node's [`TaskInputs`].
    ///
    /// [`TaskInputs`]: crate::dag::node::TaskInputs
    pub inputs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub members: Vec<String>,
    pub max_active_tasks: Option<usize>,
}

/// A validated graph with groups flattened into concrete nodes.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Nodes in declaration order.
    pub nodes: Vec<PlannedNode>,
    /// Node ids in topological order (safe to execute in this sequence).
    pub order: Vec<String>,
    /// Map from node id to the ids it must wait for.
    pub dependencies: HashMap<String, HashSet<String>>,
    /// Map from node id to the ids waiting on it.
    pub dependents: HashMap<String, HashSet<String>>,
    pub groups: Vec<GroupInfo>,
    index: HashMap<String, usize>,
}

impl Plan {
    pub fn node(&self, id: &str) -> Option<&PlannedNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn group(&self, name: &str) -> Option<&GroupInfo> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node reachable from `id` through dependency edges.
    pub fn downstream_of(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            for next in self.dependents.get(&current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    out.push(next.clone());
                    stack.push(next.clone());
                }
            }
        }
        out.sort_by_key(|n| self.position(n));
        out
    }
}

#[derive(Default)]
struct PlanBuilder {
    nodes: Vec<PlannedNode>,
    index: HashMap<String, usize>,
    dependencies: HashMap<String, HashSet<String>>,
    dependents: HashMap<String, HashSet<String>>,
    groups: Vec<GroupInfo>,
}

impl PlanBuilder {
    fn declare(&mut self, id: String, group: Option<&str>, node: &TaskNode) -> Result<(), DagError> {
        if self.index.contains_key(&id) {
            return Err(DagError::DuplicateNode(id));
        }
        self.index.insert(id.clone(), self.nodes.len());
        self.dependencies.entry(id.clone()).or_default();
        self.dependents.entry(id.clone()).or_default();
        self.nodes.push(PlannedNode {
            id,
            group: group.map(String::from),
            node: node.clone(),
            inputs: Vec::new(),
        });
        Ok(())
    }

    fn connect(&mut self, producer: &str, consumer: &str, key: Option<String>) -> Result<(), DagError> {
        if producer == consumer {
            return Err(DagError::SelfEdge(producer.to_string()));
        }
        self.dependencies
            .entry(consumer.to_string())
            .or_default()
            .insert(producer.to_string());
        self.dependents
            .entry(producer.to_string())
            .or_default()
            .insert(consumer.to_string());

        let Some(key) = key else { return Ok(()) };
        let planned = &mut self.nodes[self.index[consumer]];
        if let Some((_, existing)) = planned.inputs.iter().find(|(k, _)| *k == key) {
            if existing == producer {
                return Ok(());
            }
            return Err(DagError::AmbiguousInput {
                node: consumer.to_string(),
                key,
                producers: vec![existing.clone(), producer.to_string()],
            });
        }
        planned.inputs.push((key, producer.to_string()));
        Ok(())
    }

    /// Topological sort (Kahn's algorithm), ties broken by declaration order.
    fn finish(self) -> Result<Plan, DagError> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| self.dependencies[&n.id].len())
            .collect();

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            let id = &self.nodes[i].id;
            order.push(id.clone());
            for dependent in &self.dependents[id] {
                let j = self.index[dependent];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let remaining = in_degree
                .iter()
                .enumerate()
                .filter(|(_, deg)| **deg > 0)
                .map(|(i, _)| self.nodes[i].id.clone())
                .collect();
            return Err(DagError::Cycle(remaining));
        }

        Ok(Plan {
            nodes: self.nodes,
            order,
            dependencies: self.dependencies,
            dependents: self.dependents,
            groups: self.groups,
            index: self.index,
        })
    }
}

fn check_name(name: &str) -> Result<(), DagError> {
    if name.is_empty() || name.contains('.') {
        return Err(DagError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn find_group<'g>(graph: &'g DependencyGraph, name: &str) -> Result<&'g TaskGroup, DagError> {
    graph
        .group(name)
        .ok_or_else(|| DagError::UnknownNode(name.to_string()))
}

/// Names that look like `group.member` are rejected as boundary violations
/// rather than unknown nodes when the member exists.
fn missing_node(graph: &DependencyGraph, name: &str) -> DagError {
    if let Some((group, local)) = name.split_once('.') {
        if graph.group(group).is_some_and(|g| g.contains(local)) {
            return DagError::GroupBoundary(name.to_string());
        }
    }
    DagError::UnknownNode(name.to_string())
}

/// Entry members of a group: those without an internal upstream.
fn entry_members(group: &TaskGroup) -> Vec<String> {
    let consumers: HashSet<&str> = group.edges().iter().map(|(_, c, _)| c.as_str()).collect();
    group
        .nodes()
        .iter()
        .filter(|n| !consumers.contains(n.name.as_str()))
        .map(|n| group.qualify(&n.name))
        .collect()
}

/// Concrete producers for an endpoint, with the key their data is delivered under.
fn producer_side(graph: &DependencyGraph, endpoint: &Endpoint) -> Result<Vec<(String, Option<String>)>, DagError> {
    match endpoint {
        Endpoint::Node(name) => {
            if graph.nodes().iter().any(|n| &n.name == name) {
                Ok(vec![(name.clone(), Some(name.clone()))])
            } else {
                Err(missing_node(graph, name))
            }
        }
        Endpoint::Group(name) => {
            let group = find_group(graph, name)?;
            Ok(group.nodes().iter().map(|n| (group.qualify(&n.name), None)).collect())
        }
        Endpoint::Port { group, port } => {
            let g = find_group(graph, group)?;
            let source = g.output_source(port).ok_or_else(|| DagError::UnknownPort {
                group: group.clone(),
                port: port.clone(),
            })?;
            Ok(vec![(g.qualify(source), Some(format!("{group}.{port}")))])
        }
    }
}

/// Concrete consumers for an endpoint, with an optional input key override.
fn consumer_side(graph: &DependencyGraph, endpoint: &Endpoint) -> Result<Vec<(String, Option<String>)>, DagError> {
    match endpoint {
        Endpoint::Node(name) => {
            if graph.nodes().iter().any(|n| &n.name == name) {
                Ok(vec![(name.clone(), None)])
            } else {
                Err(missing_node(graph, name))
            }
        }
        Endpoint::Group(name) => {
            let group = find_group(graph, name)?;
            Ok(entry_members(group).into_iter().map(|id| (id, None)).collect())
        }
        Endpoint::Port { group, port } => {
            let g = find_group(graph, group)?;
            let targets = g.input_targets(port);
            if targets.is_empty() {
                return Err(DagError::UnknownPort {
                    group: group.clone(),
                    port: port.clone(),
                });
            }
            Ok(targets
                .into_iter()
                .map(|t| (g.qualify(t), Some(port.clone())))
                .collect())
        }
    }
}

/// Flatten a graph definition into an executable plan, checking names, edge
/// references, group boundaries, input routing and acyclicity.
pub fn resolve(graph: &DependencyGraph) -> Result<Plan, DagError> {
    let mut builder = PlanBuilder::default();

    for node in graph.nodes() {
        check_name(&node.name)?;
        builder.declare(node.name.clone(), None, node)?;
    }

    for group in graph.groups() {
        check_name(group.name())?;
        if builder.index.contains_key(group.name()) || builder.groups.iter().any(|g| g.name == group.name()) {
            return Err(DagError::DuplicateNode(group.name().to_string()));
        }

        let mut members = Vec::new();
        for node in group.nodes() {
            check_name(&node.name)?;
            let id = group.qualify(&node.name);
            builder.declare(id.clone(), Some(group.name()), node)?;
            members.push(id);
        }

        for (_, member) in group.input_ports().iter().chain(group.output_ports()) {
            if !group.contains(member) {
                return Err(DagError::UnknownNode(group.qualify(member)));
            }
        }

        for (producer, consumer, kind) in group.edges() {
            for name in [producer, consumer] {
                if !group.contains(name) {
                    return Err(DagError::UnknownNode(group.qualify(name)));
                }
            }
            let key = (*kind == EdgeKind::Data).then(|| producer.clone());
            builder.connect(&group.qualify(producer), &group.qualify(consumer), key)?;
        }

        builder.groups.push(GroupInfo {
            name: group.name().to_string(),
            members,
            max_active_tasks: group.concurrency(),
        });
    }

    for edge in graph.edges() {
        let producers = producer_side(graph, &edge.producer)?;
        let consumers = consumer_side(graph, &edge.consumer)?;
        let carries_data = edge.kind == EdgeKind::Data
            && !matches!(edge.producer, Endpoint::Group(_))
            && !matches!(edge.consumer, Endpoint::Group(_));

        for (producer, producer_key) in &producers {
            for (consumer, port_key) in &consumers {
                let key = if carries_data {
                    port_key.clone().or_else(|| producer_key.clone())
                } else {
                    None
                };
                builder.connect(producer, consumer, key)?;
            }
        }
    }

    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::node::{task_fn, NodeOutput};

    fn noop(name: &str) -> TaskNode {
        TaskNode::task(name, task_fn(|_| async { Ok(NodeOutput::Empty) }))
    }

    fn graph_of(names: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for name in names {
            graph.add_node(noop(name));
        }
        for (p, c) in edges {
            graph.add_edge(*p, *c);
        }
        graph
    }

    #[test]
    fn linear_pipeline_resolves() {
        let graph = graph_of(&["fetch", "clean", "save"], &[("fetch", "clean"), ("clean", "save")]);
        let plan = graph.validate().unwrap();
        assert_eq!(plan.order, vec!["fetch", "clean", "save"]);
        assert!(plan.dependencies["fetch"].is_empty());
        assert!(plan.dependencies["clean"].contains("fetch"));
        assert_eq!(plan.node("save").unwrap().inputs, vec![("clean".to_string(), "clean".to_string())]);
    }

    #[test]
    fn independent_nodes_keep_declaration_order() {
        let graph = graph_of(&["c", "a", "b", "z"], &[("a", "z")]);
        assert_eq!(graph.topological_order().unwrap(), vec!["c", "a", "b", "z"]);
    }

    #[test]
    fn diamond_dag_resolves() {
        //    fetch
        //    /    \
        // clean_a  clean_b
        //    \    /
        //    merge
        let graph = graph_of(
            &["fetch", "clean_a", "clean_b", "merge"],
            &[("fetch", "clean_a"), ("fetch", "clean_b"), ("clean_a", "merge"), ("clean_b", "merge")],
        );
        let plan = graph.validate().unwrap();
        assert_eq!(plan.order, vec!["fetch", "clean_a", "clean_b", "merge"]);
        assert_eq!(plan.node("merge").unwrap().inputs.len(), 2);
        assert_eq!(plan.downstream_of("fetch"), vec!["clean_a", "clean_b", "merge"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let graph = graph_of(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c"), ("c", "b"), ("c", "d")]);
        match graph.validate() {
            Err(DagError::Cycle(nodes)) => assert_eq!(nodes, vec!["b", "c", "d"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_edge_is_rejected() {
        let graph = graph_of(&["a"], &[("a", "a")]);
        assert!(matches!(graph.validate(), Err(DagError::SelfEdge(ref n)) if n == "a"));
    }

    #[test]
    fn unknown_and_duplicate_nodes_are_rejected() {
        let graph = graph_of(&["a"], &[("a", "ghost")]);
        assert!(matches!(graph.validate(), Err(DagError::UnknownNode(ref n)) if n == "ghost"));

        let graph = graph_of(&["a", "a"], &[]);
        assert!(matches!(graph.validate(), Err(DagError::DuplicateNode(ref n)) if n == "a"));

        let graph = graph_of(&["bad.name"], &[]);
        assert!(matches!(graph.validate(), Err(DagError::InvalidName(_))));
    }

    fn extract_and_load() -> DependencyGraph {
        let mut graph = DependencyGraph::new();

        let mut extract = TaskGroup::new("extract");
        extract
            .add_node(noop("sensor"))
            .add_node(noop("pull"))
            .add_completion_edge("sensor", "pull")
            .expose_output("rows", "pull");
        graph.add_group(extract);

        let mut load = TaskGroup::new("load").max_active_tasks(1);
        load.add_node(noop("write")).expose_input("rows", "write");
        let load = graph.add_group(load);

        graph.add_node(noop("report"));
        graph.add_edge(Endpoint::port("extract", "rows"), Endpoint::port("load", "rows"));
        graph.add_completion_edge(load, "report");
        graph
    }

    #[test]
    fn groups_flatten_with_port_routing() {
        let plan = extract_and_load().validate().unwrap();
        assert_eq!(plan.order, vec!["extract.sensor", "extract.pull", "load.write", "report"]);

        let pull = plan.node("extract.pull").unwrap();
        assert!(pull.inputs.is_empty(), "completion edges carry no data");
        assert!(plan.dependencies["extract.pull"].contains("extract.sensor"));

        let write = plan.node("load.write").unwrap();
        assert_eq!(write.group.as_deref(), Some("load"));
        assert_eq!(write.inputs, vec![("rows".to_string(), "extract.pull".to_string())]);

        assert!(plan.dependencies["report"].contains("load.write"));
        assert!(plan.node("report").unwrap().inputs.is_empty());
        assert_eq!(plan.group("load").unwrap().max_active_tasks, Some(1));
    }

    #[test]
    fn group_output_reaches_top_level_node_under_qualified_key() {
        let mut graph = extract_and_load();
        graph.add_node(noop("audit"));
        graph.add_edge(Endpoint::port("extract", "rows"), "audit");
        let plan = graph.validate().unwrap();
        assert_eq!(
            plan.node("audit").unwrap().inputs,
            vec![("extract.rows".to_string(), "extract.pull".to_string())]
        );
    }

    #[test]
    fn group_members_are_not_addressable_from_outside() {
        let mut graph = extract_and_load();
        graph.add_edge("extract.pull", "report");
        assert!(matches!(graph.validate(), Err(DagError::GroupBoundary(ref n)) if n == "extract.pull"));
    }

    #[test]
    fn unknown_port_is_rejected() {
        let mut graph = extract_and_load();
        graph.add_edge(Endpoint::port("extract", "nope"), "report");
        assert!(matches!(graph.validate(), Err(DagError::UnknownPort { .. })));
    }

    #[test]
    fn two_producers_on_one_port_is_ambiguous() {
        let mut graph = extract_and_load();
        graph.add_node(noop("other"));
        graph.add_edge("other", Endpoint::port("load", "rows"));
        assert!(matches!(graph.validate(), Err(DagError::AmbiguousInput { .. })));
    }

    #[test]
    fn cycle_through_groups_is_rejected() {
        let mut graph = extract_and_load();
        graph.add_completion_edge("report", Endpoint::group("extract"));
        assert!(matches!(graph.validate(), Err(DagError::Cycle(_))));
    }
}
