//! Adapters that run collaborators as graph tasks.

use std::sync::Arc;

use async_trait::async_trait;
use eltflow_utils::EltResult;

use crate::dag::node::{NodeOutput, Task, TaskInputs};
use crate::destinations::traits::LoadSink;
use crate::sources::traits::{RelationalSource, Source};
use crate::transforms::traits::TransformRunner;

pub struct ExtractTask(pub Arc<dyn Source>);

#[async_trait]
impl Task for ExtractTask {
    async fn run(&self, _inputs: TaskInputs) -> EltResult<NodeOutput> {
        Ok(NodeOutput::Records(self.0.extract().await?))
    }
}

pub struct QueryTask {
    pub database: Arc<dyn RelationalSource>,
    pub sql: String,
}

#[async_trait]
impl Task for QueryTask {
    async fn run(&self, _inputs: TaskInputs) -> EltResult<NodeOutput> {
        Ok(NodeOutput::Records(self.database.query(&self.sql).await?))
    }
}

/// Loads the records arriving under `input` into `table`.
pub struct LoadTask {
    pub sink: Arc<dyn LoadSink>,
    pub input: String,
    pub table: String,
}

#[async_trait]
impl Task for LoadTask {
    async fn run(&self, inputs: TaskInputs) -> EltResult<NodeOutput> {
        let records = inputs.records(&self.input)?;
        let handle = self.sink.load(records, &self.table).await?;
        Ok(NodeOutput::Table(handle))
    }
}

pub struct TransformTask {
    pub runner: Arc<dyn TransformRunner>,
    pub selector: String,
}

#[async_trait]
impl Task for TransformTask {
    async fn run(&self, _inputs: TaskInputs) -> EltResult<NodeOutput> {
        self.runner.invoke(&self.selector).await?.into_result()?;
        Ok(NodeOutput::Text("Successfully built and tested dbt models".to_string()))
    }
}
