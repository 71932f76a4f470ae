//! The `elt_ecommerce` pipeline: orders from the API, customers from the
//! database and products from the object store are loaded into the warehouse,
//! then the dbt marts are built.

use std::sync::Arc;
use std::time::Duration;

use crate::builder::{BuildError, PipelineBuilder};
use crate::config::types::EltConfig;
use crate::dag::graph::{DependencyGraph, Endpoint};
use crate::dag::group::TaskGroup;
use crate::dag::node::TaskNode;
use crate::events::trigger::Trigger;
use crate::pipeline::tasks::{ExtractTask, LoadTask, QueryTask, TransformTask};
use crate::pipeline::{Collaborators, PipelineDef};
use crate::scheduler::retry::RetryPolicy;
use crate::sources::object_store::{ObjectExistsSensor, ObjectSource};

pub const PIPELINE: &str = "elt_ecommerce";
pub const EXTRACT_GROUP: &str = "EXTRACTING_FROM_MULTIPLE_SOURCES";
pub const LOAD_GROUP: &str = "LOAD_INTO_BIGQUERY";
pub const TRANSFORM_GROUP: &str = "TRANSFORM_USING_DBT";

/// Ports between the extract and load groups, in load order.
pub const DATASETS: [&str; 3] = ["products", "orders", "customers"];

fn retry_policy(config: &EltConfig) -> RetryPolicy {
    RetryPolicy::exponential(config.run.retries, config.run.retry_delay).max_delay(Duration::from_secs(3600))
}

pub fn build_graph(config: &EltConfig, collaborators: Collaborators) -> DependencyGraph {
    let retry = retry_policy(config);
    let object = config.object_store.object.clone();

    let mut extract = TaskGroup::new(EXTRACT_GROUP).tooltip("Extract data from various sources");
    extract
        .add_node(TaskNode::task("extract_from_api", ExtractTask(collaborators.api.clone())).retry(retry.clone()))
        .add_node(
            TaskNode::task(
                "extract_from_postgres",
                QueryTask {
                    database: collaborators.database.clone(),
                    sql: config.postgres.query.clone(),
                },
            )
            .retry(retry.clone()),
        )
        .add_node(
            TaskNode::sensor(
                "wait_for_gcs_file",
                ObjectExistsSensor::new(collaborators.objects.clone(), object.clone()),
            )
            .poke_interval(config.sensor.poke_interval)
            .sensor_timeout(config.sensor.timeout),
        )
        .add_node(
            TaskNode::task(
                "extract_from_gcs",
                ExtractTask(Arc::new(ObjectSource::new(collaborators.objects.clone(), object))),
            )
            .retry(retry.clone()),
        )
        .add_completion_edge("wait_for_gcs_file", "extract_from_gcs")
        .expose_output("orders", "extract_from_api")
        .expose_output("customers", "extract_from_postgres")
        .expose_output("products", "extract_from_gcs");

    let mut load = TaskGroup::new(LOAD_GROUP).tooltip("Load raw data into BigQuery");
    for dataset in DATASETS {
        let table = match dataset {
            "products" => &config.tables.products,
            "orders" => &config.tables.orders,
            _ => &config.tables.customers,
        };
        let node = format!("load_{dataset}");
        load.add_node(
            TaskNode::task(
                node.clone(),
                LoadTask {
                    sink: collaborators.warehouse.clone(),
                    input: dataset.to_string(),
                    table: table.clone(),
                },
            )
            .retry(retry.clone()),
        )
        .expose_input(dataset, node);
    }

    let mut transform = TaskGroup::new(TRANSFORM_GROUP).tooltip("Run dbt transformations");
    transform.add_node(TaskNode::task(
        "run_dbt_models",
        TransformTask {
            runner: collaborators.transform.clone(),
            selector: config.dbt.selector.clone(),
        },
    ));

    let mut graph = DependencyGraph::new();
    graph.add_group(extract);
    let load = graph.add_group(load);
    let transform = graph.add_group(transform);

    for dataset in DATASETS {
        graph.add_edge(Endpoint::port(EXTRACT_GROUP, dataset), Endpoint::port(LOAD_GROUP, dataset));
    }
    graph.add_completion_edge(load, transform);
    graph
}

/// The full pipeline definition: daily unless an interval is configured,
/// no catch-up of missed runs.
pub fn definition(config: &EltConfig, collaborators: Collaborators) -> Result<(Trigger, PipelineDef), BuildError> {
    let trigger = match config.run.schedule_every {
        Some(every) => Trigger::Interval(every),
        None => Trigger::Daily,
    };
    PipelineBuilder::new(PIPELINE)
        .description("Extract from API, database and object store, load into the warehouse, build dbt marts")
        .tags(["ecommerce", "elt"])
        .trigger(trigger)
        .max_active_tasks(config.run.max_active_tasks)
        .graph(build_graph(config, collaborators))
        .build()
}
