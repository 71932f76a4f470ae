//! Pipeline definitions: a validated plan plus the settings it runs with.

pub mod ecommerce;
pub mod tasks;

use std::sync::Arc;

use eltflow_utils::EltResult;

use crate::config::types::EltConfig;
use crate::dag::resolver::Plan;
use crate::destinations::traits::{LoadOptions, LoadSink};
use crate::destinations::warehouse::WarehouseSink;
use crate::scheduler::runner::ExecutorConfig;
use crate::sources::http_client::HttpSourceBuilder;
use crate::sources::object_store::{FsObjectStore, GcsObjectStore};
use crate::sources::sql::SqlSource;
use crate::sources::traits::{ObjectStore, RelationalSource, Source};
use crate::transforms::dbt::DbtRunner;
use crate::transforms::traits::TransformRunner;

/// A registered pipeline: its name, metadata and executable plan.
#[derive(Debug, Clone)]
pub struct PipelineDef {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub plan: Plan,
    pub executor: ExecutorConfig,
}

/// The external systems a pipeline talks to. Tests swap in fakes.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn Source>,
    pub database: Arc<dyn RelationalSource>,
    pub objects: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn LoadSink>,
    pub transform: Arc<dyn TransformRunner>,
}

impl Collaborators {
    /// Real clients built from configuration.
    pub fn from_config(config: &EltConfig) -> EltResult<Self> {
        let api = HttpSourceBuilder::new(&config.api.base_url)
            .name("mockapi")
            .endpoint(&config.api.endpoint)
            .token(config.api.token.clone())
            .build()?;

        let database = SqlSource::new(&config.postgres.conn).name_as("postgres");

        let objects: Arc<dyn ObjectStore> = match &config.object_store.root {
            Some(root) => Arc::new(FsObjectStore::new(root, &config.object_store.bucket)),
            None => Arc::new(GcsObjectStore::new(
                &config.object_store.bucket,
                config.object_store.token.clone(),
            )),
        };

        let warehouse = WarehouseSink::open(&config.warehouse.path, &config.project_id, &config.dataset)?
            .with_options(LoadOptions {
                write_mode: config.warehouse.write_mode,
                schema_inference: config.warehouse.schema_inference,
            });

        let transform = DbtRunner::new(&config.dbt.project_dir, &config.dbt.profiles_dir).program(&config.dbt.program);

        Ok(Self {
            api: Arc::new(api),
            database: Arc::new(database),
            objects,
            warehouse: Arc::new(warehouse),
            transform: Arc::new(transform),
        })
    }
}
