use crate::dag::graph::{DagError, DependencyGraph};
use crate::events::trigger::Trigger;
use crate::pipeline::PipelineDef;
use crate::scheduler::runner::ExecutorConfig;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("pipeline name is required")]
    NoName,
    #[error("trigger is required")]
    NoTrigger,
    #[error("pipeline graph has no nodes")]
    EmptyGraph,
    #[error("DAG resolution failed: {0}")]
    DagError(#[from] DagError),
}

pub struct PipelineBuilder {
    name: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    trigger: Option<Trigger>,
    graph: DependencyGraph,
    executor: ExecutorConfig,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name: (!name.trim().is_empty()).then_some(name),
            description: None,
            tags: Vec::new(),
            trigger: None,
            graph: DependencyGraph::new(),
            executor: ExecutorConfig::default(),
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn graph(mut self, graph: DependencyGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_active_tasks(mut self, limit: usize) -> Self {
        self.executor.max_active_tasks = limit.max(1);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.executor.fail_fast = fail_fast;
        self
    }

    pub fn build(self) -> Result<(Trigger, PipelineDef), BuildError> {
        let name = self.name.ok_or(BuildError::NoName)?;
        let trigger = self.trigger.ok_or(BuildError::NoTrigger)?;

        let plan = self.graph.validate()?;
        if plan.is_empty() {
            return Err(BuildError::EmptyGraph);
        }

        Ok((
            trigger,
            PipelineDef {
                name,
                description: self.description,
                tags: self.tags,
                plan,
                executor: self.executor,
            },
        ))
    }
}
