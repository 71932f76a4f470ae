pub mod graph;
pub mod group;
pub mod node;
pub mod resolver;

pub use graph::{DagError, DependencyGraph, Edge, EdgeKind, Endpoint};
pub use group::TaskGroup;
pub use node::{task_fn, NodeKind, NodeOutput, Task, TaskInputs, TaskNode};
pub use resolver::{GroupInfo, Plan, PlannedNode};
