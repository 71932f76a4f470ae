use std::fmt;

use crate::dag::group::TaskGroup;
use crate::dag::node::TaskNode;
use crate::dag::resolver::{self, Plan};

/// Errors raised while validating a graph definition. All of them are fatal:
/// a run never starts on an invalid graph.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("Cycle detected in DAG involving tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("Edge references undeclared node: {0}")]
    UnknownNode(String),

    #[error("Node declared more than once: {0}")]
    DuplicateNode(String),

    #[error("Invalid node name '{0}': names must be non-empty and must not contain '.'")]
    InvalidName(String),

    #[error("Group '{group}' has no port named '{port}'")]
    UnknownPort { group: String, port: String },

    #[error("'{0}' is internal to its group; attach to a declared port instead")]
    GroupBoundary(String),

    #[error("Node '{0}' cannot depend on itself")]
    SelfEdge(String),

    #[error("Node '{node}' receives input '{key}' from more than one producer: {producers:?}")]
    AmbiguousInput {
        node: String,
        key: String,
        producers: Vec<String>,
    },
}

/// One side of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Node(String),
    /// A whole group; as a producer it completes when every member completes.
    Group(String),
    Port { group: String, port: String },
}

impl Endpoint {
    pub fn node(name: impl Into<String>) -> Self {
        Endpoint::Node(name.into())
    }

    pub fn group(name: impl Into<String>) -> Self {
        Endpoint::Group(name.into())
    }

    pub fn port(group: impl Into<String>, port: impl Into<String>) -> Self {
        Endpoint::Port {
            group: group.into(),
            port: port.into(),
        }
    }
}

impl From<&str> for Endpoint {
    fn from(name: &str) -> Self {
        Endpoint::Node(name.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(name: String) -> Self {
        Endpoint::Node(name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Node(name) => write!(f, "{name}"),
            Endpoint::Group(name) => write!(f, "{name}/*"),
            Endpoint::Port { group, port } => write!(f, "{group}.{port}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Consumer waits for the producer and receives its output.
    Data,
    /// Consumer only waits for the producer to succeed.
    Completion,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub producer: Endpoint,
    pub consumer: Endpoint,
    pub kind: EdgeKind,
}

/// Declared nodes, groups and edges of one pipeline.
///
/// Construction never fails; everything is checked by [`DependencyGraph::validate`],
/// which produces the executable [`Plan`].
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<TaskNode>,
    groups: Vec<TaskGroup>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: TaskNode) -> Endpoint {
        let endpoint = Endpoint::Node(node.name.clone());
        self.nodes.push(node);
        endpoint
    }

    pub fn add_group(&mut self, group: TaskGroup) -> Endpoint {
        let endpoint = Endpoint::Group(group.name().to_string());
        self.groups.push(group);
        endpoint
    }

    pub fn add_edge(&mut self, producer: impl Into<Endpoint>, consumer: impl Into<Endpoint>) -> &mut Self {
        self.push_edge(producer.into(), consumer.into(), EdgeKind::Data)
    }

    pub fn add_completion_edge(
        &mut self,
        producer: impl Into<Endpoint>,
        consumer: impl Into<Endpoint>,
    ) -> &mut Self {
        self.push_edge(producer.into(), consumer.into(), EdgeKind::Completion)
    }

    fn push_edge(&mut self, producer: Endpoint, consumer: Endpoint, kind: EdgeKind) -> &mut Self {
        self.edges.push(Edge {
            producer,
            consumer,
            kind,
        });
        self
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn group(&self, name: &str) -> Option<&TaskGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    /// Check the definition and flatten it into an executable plan.
    pub fn validate(&self) -> Result<Plan, DagError> {
        resolver::resolve(self)
    }

    /// Deterministic execution order, for diagnostics. Nodes without a relative
    /// constraint keep their declaration order.
    pub fn topological_order(&self) -> Result<Vec<String>, DagError> {
        self.validate().map(|plan| plan.order)
    }
}
