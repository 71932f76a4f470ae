use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};

use crate::destinations::traits::TableHandle;
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::sensor::{Sensor, SensorConfig};

/// Value produced by a node and routed to its consumers.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Records(RecordSet),
    Table(TableHandle),
    /// Sensors produce `Flag(true)` once satisfied.
    Flag(bool),
    Text(String),
    Empty,
}

impl NodeOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeOutput::Records(_) => "records",
            NodeOutput::Table(_) => "table",
            NodeOutput::Flag(_) => "flag",
            NodeOutput::Text(_) => "text",
            NodeOutput::Empty => "empty",
        }
    }

    pub fn as_records(&self) -> Option<&RecordSet> {
        match self {
            NodeOutput::Records(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableHandle> {
        match self {
            NodeOutput::Table(t) => Some(t),
            _ => None,
        }
    }
}

/// Outputs of a node's upstream producers, keyed by upstream identity.
#[derive(Debug, Clone, Default)]
pub struct TaskInputs(HashMap<String, NodeOutput>);

impl TaskInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: NodeOutput) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&NodeOutput> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn records(&self, key: &str) -> EltResult<&RecordSet> {
        match self.0.get(key) {
            Some(NodeOutput::Records(records)) => Ok(records),
            Some(other) => Err(Error::task(format!(
                "input `{key}` holds {}, expected records",
                other.kind()
            ))),
            None => Err(Error::task(format!("missing input `{key}`"))),
        }
    }

    /// The single record-set input, for nodes fed by exactly one producer.
    pub fn only_records(&self) -> EltResult<&RecordSet> {
        let mut found = self.0.values().filter_map(NodeOutput::as_records);
        match (found.next(), found.next()) {
            (Some(records), None) => Ok(records),
            (None, _) => Err(Error::task("no record input")),
            (Some(_), Some(_)) => Err(Error::task("more than one record input")),
        }
    }
}

impl FromIterator<(String, NodeOutput)> for TaskInputs {
    fn from_iter<I: IntoIterator<Item = (String, NodeOutput)>>(iter: I) -> Self {
        TaskInputs(iter.into_iter().collect())
    }
}

/// The run function of a node.
///
/// Must depend only on `inputs`: the executor may call it again with the same
/// inputs after a failed attempt.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, inputs: TaskInputs) -> EltResult<NodeOutput>;
}

/// Adapter turning an async closure into a [`Task`].
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(TaskInputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EltResult<NodeOutput>> + Send + 'static,
{
    async fn run(&self, inputs: TaskInputs) -> EltResult<NodeOutput> {
        (self.0)(inputs).await
    }
}

pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(TaskInputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EltResult<NodeOutput>> + Send + 'static,
{
    FnTask(f)
}

#[derive(Clone)]
pub enum NodeKind {
    Task(Arc<dyn Task>),
    Sensor {
        sensor: Arc<dyn Sensor>,
        config: SensorConfig,
    },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Task(_) => f.write_str("Task"),
            NodeKind::Sensor { config, .. } => f.debug_struct("Sensor").field("config", config).finish(),
        }
    }
}

/// A single unit of work in the graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: String,
    pub kind: NodeKind,
    pub retry: RetryPolicy,
    /// Per-attempt limit. Sensors use their own deadline instead.
    pub timeout: Option<Duration>,
}

impl TaskNode {
    pub fn task(name: impl Into<String>, task: impl Task + 'static) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Task(Arc::new(task)),
            retry: RetryPolicy::none(),
            timeout: None,
        }
    }

    pub fn sensor(name: impl Into<String>, sensor: impl Sensor + 'static) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Sensor {
                sensor: Arc::new(sensor),
                config: SensorConfig::default(),
            },
            retry: RetryPolicy::none(),
            timeout: None,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn poke_interval(mut self, interval: Duration) -> Self {
        if let NodeKind::Sensor { config, .. } = &mut self.kind {
            config.poke_interval = interval;
        }
        self
    }

    pub fn sensor_timeout(mut self, timeout: Duration) -> Self {
        if let NodeKind::Sensor { config, .. } = &mut self.kind {
            config.timeout = timeout;
        }
        self
    }

    pub fn is_sensor(&self) -> bool {
        matches!(self.kind, NodeKind::Sensor { .. })
    }
}
