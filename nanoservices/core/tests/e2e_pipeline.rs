use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eltflow_core::config::{self, EltConfig};
use eltflow_core::destinations::warehouse::WarehouseSink;
use eltflow_core::destinations::{LoadSink, TableHandle};
use eltflow_core::engine::EltFlow;
use eltflow_core::pipeline::{ecommerce, Collaborators};
use eltflow_core::scheduler::{Executor, NodeState, RunReport, SensorState};
use eltflow_core::sources::object_store::FsObjectStore;
use eltflow_core::sources::sql::SqlSource;
use eltflow_core::sources::traits::Source;
use eltflow_core::store::Store;
use eltflow_core::transforms::traits::{TransformOutcome, TransformRunner};
use eltflow_utils::{EltResult, RecordSet};
use serde_json::json;

const GCS_EXTRACT: &str = "EXTRACTING_FROM_MULTIPLE_SOURCES.extract_from_gcs";
const GCS_SENSOR: &str = "EXTRACTING_FROM_MULTIPLE_SOURCES.wait_for_gcs_file";
const LOAD_PRODUCTS: &str = "LOAD_INTO_BIGQUERY.load_products";
const LOAD_ORDERS: &str = "LOAD_INTO_BIGQUERY.load_orders";
const LOAD_CUSTOMERS: &str = "LOAD_INTO_BIGQUERY.load_customers";
const DBT: &str = "TRANSFORM_USING_DBT.run_dbt_models";

struct FakeApi;

#[async_trait]
impl Source for FakeApi {
    fn name(&self) -> &str {
        "mockapi"
    }

    async fn extract(&self) -> EltResult<RecordSet> {
        RecordSet::from_json_rows(&[
            json!({"order_id": 1, "customer_id": 10, "total": 31.5}),
            json!({"order_id": 2, "customer_id": 11, "total": 12.0}),
        ])
    }
}

/// Records each invocation along with the warehouse row counts it saw.
struct FakeDbt {
    warehouse: WarehouseSink,
    status: i32,
    seen: Mutex<Vec<[usize; 3]>>,
}

#[async_trait]
impl TransformRunner for FakeDbt {
    fn name(&self) -> &str {
        "dbt"
    }

    async fn invoke(&self, selector: &str) -> EltResult<TransformOutcome> {
        let counts = [
            self.warehouse.row_count("products").await.unwrap_or(0),
            self.warehouse.row_count("orders").await.unwrap_or(0),
            self.warehouse.row_count("customers").await.unwrap_or(0),
        ];
        self.seen.lock().unwrap().push(counts);
        Ok(TransformOutcome {
            selector: selector.to_string(),
            status: self.status,
            stdout: "Running with dbt=1.8.0".into(),
            stderr: if self.status == 0 {
                String::new()
            } else {
                "Compilation Error in model mart_ecom_sales_summary".into()
            },
        })
    }
}

/// Holds every load open for a while and remembers how many overlapped.
struct OverlapSink {
    inner: WarehouseSink,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl LoadSink for OverlapSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn load(&self, records: &RecordSet, destination: &str) -> EltResult<TableHandle> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let loaded = self.inner.load(records, destination).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        loaded
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    config: EltConfig,
    warehouse: WarehouseSink,
    dbt: Arc<FakeDbt>,
    collaborators: Collaborators,
}

fn seed_customers(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (customer_id INTEGER, email TEXT);
         INSERT INTO customers VALUES (10, 'ana@shop.io'), (11, NULL), (12, 'li@shop.io');",
    )
    .unwrap();
}

fn write_products(root: &Path) {
    let dir = root.join("raw-bucket/ecom_raw");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("products.csv"),
        "product_id,name,price\n1,mug,9.5\n2,cap,12\n3,tee,18\n4,pin,2.5\n5,bag,30\n",
    )
    .unwrap();
}

fn fixture(dbt_status: i32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("objects");
    let db = dir.path().join("shop.db");
    seed_customers(&db);

    let vars: HashMap<&str, String> = [
        ("GCP_PROJECT_ID", "proj".to_string()),
        ("BQ_DATASET", "ecom".to_string()),
        ("BQ_TABLE_ECOM_PRODUCTS", "products".to_string()),
        ("BQ_TABLE_ECOM_CUSTOMERS_ECOM", "customers".to_string()),
        ("BQ_TABLE_ECOM_ORDERS", "orders".to_string()),
        ("DBT_PROJECT_DIR", "dbt".to_string()),
        ("DBT_PROFILES_DIR", "dbt".to_string()),
        ("POSTGRES_CONN", format!("sqlite://{}", db.display())),
        ("GCS_BUCKET", "raw-bucket".to_string()),
        ("MOCKAPI_BASE_URL", "http://mockapi.invalid".to_string()),
        ("ELTFLOW_DB", dir.path().join("runs.db").display().to_string()),
    ]
    .into_iter()
    .collect();
    let config = config::from_lookup(|key: &str| vars.get(key).cloned()).unwrap();

    let warehouse = WarehouseSink::in_memory("proj", "ecom").unwrap();
    let dbt = Arc::new(FakeDbt {
        warehouse: warehouse.clone(),
        status: dbt_status,
        seen: Mutex::new(Vec::new()),
    });
    let collaborators = Collaborators {
        api: Arc::new(FakeApi),
        database: Arc::new(SqlSource::new(&config.postgres.conn)),
        objects: Arc::new(FsObjectStore::new(&root, &config.object_store.bucket)),
        warehouse: Arc::new(warehouse.clone()) as Arc<dyn LoadSink>,
        transform: dbt.clone(),
    };

    Fixture {
        _dir: dir,
        root,
        config,
        warehouse,
        dbt,
        collaborators,
    }
}

async fn run(fixture: &Fixture) -> RunReport {
    let (_, def) = ecommerce::definition(&fixture.config, fixture.collaborators.clone()).unwrap();
    Executor::new(def.name.clone(), def.executor).run(&def.plan).await
}

#[tokio::test(start_paused = true)]
async fn all_sources_present_loads_then_transforms() {
    let mut fx = fixture(0);
    write_products(&fx.root);
    let sink = Arc::new(OverlapSink {
        inner: fx.warehouse.clone(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    fx.collaborators.warehouse = sink.clone();

    let start = tokio::time::Instant::now();
    let report = run(&fx).await;

    assert!(report.success, "{}", report.summary());
    assert!(report.nodes.iter().all(|n| n.state == NodeState::Succeeded));
    assert_eq!(report.node(GCS_SENSOR).unwrap().sensor, Some(SensorState::Satisfied));

    assert_eq!(fx.warehouse.row_count("products").await.unwrap(), 5);
    assert_eq!(fx.warehouse.row_count("orders").await.unwrap(), 2);
    assert_eq!(fx.warehouse.row_count("customers").await.unwrap(), 3);

    // dbt ran once, after every load had landed
    assert_eq!(*fx.dbt.seen.lock().unwrap(), vec![[5, 2, 3]]);

    // the three loads share one 30s window instead of queueing
    assert_eq!(sink.peak.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() < Duration::from_secs(60), "took {:?}", start.elapsed());

    let customers = fx.warehouse.read_rows("customers").await.unwrap();
    assert_eq!(customers[1]["email"], serde_json::Value::Null);
}

#[tokio::test(start_paused = true)]
async fn missing_object_poisons_only_its_branch() {
    let fx = fixture(0);
    let start = tokio::time::Instant::now();

    let report = run(&fx).await;

    assert!(!report.success);
    let sensor = report.node(GCS_SENSOR).unwrap();
    assert_eq!(sensor.state, NodeState::Failed);
    assert_eq!(sensor.sensor, Some(SensorState::TimedOut));
    assert_eq!(sensor.error_kind.as_deref(), Some("sensor_timeout"));

    // the poll loop gives up at the deadline, not before
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(600), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(630), "gave up after {waited:?}");

    for id in [GCS_EXTRACT, LOAD_PRODUCTS, DBT] {
        assert_eq!(report.state_of(id), Some(NodeState::UpstreamFailed), "{id}");
        assert_eq!(report.node(id).unwrap().attempts, 0, "{id}");
    }
    assert_eq!(report.state_of(LOAD_ORDERS), Some(NodeState::Succeeded));
    assert_eq!(report.state_of(LOAD_CUSTOMERS), Some(NodeState::Succeeded));
    assert_eq!(fx.warehouse.row_count("orders").await.unwrap(), 2);
    assert_eq!(fx.warehouse.row_count("customers").await.unwrap(), 3);

    let causes = report.root_causes();
    assert_eq!(causes.len(), 1);
    assert_eq!(causes[0].id, GCS_SENSOR);
    assert!(fx.dbt.seen.lock().unwrap().is_empty());
    assert!(report.summary().contains("wait_for_gcs_file"));
}

#[tokio::test(start_paused = true)]
async fn late_object_is_picked_up_on_a_later_poke() {
    let fx = fixture(0);
    let root = fx.root.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(95)).await;
        write_products(&root);
    });

    let report = run(&fx).await;

    assert!(report.success, "{}", report.summary());
    assert_eq!(fx.warehouse.row_count("products").await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn failing_transform_keeps_loads() {
    let fx = fixture(1);
    write_products(&fx.root);

    let report = run(&fx).await;

    assert!(!report.success);
    let dbt = report.node(DBT).unwrap();
    assert_eq!(dbt.state, NodeState::Failed);
    assert_eq!(dbt.attempts, 1);
    assert_eq!(dbt.error_kind.as_deref(), Some("transform"));
    assert!(dbt.error.as_deref().unwrap().contains("Compilation Error"));

    for id in [LOAD_PRODUCTS, LOAD_ORDERS, LOAD_CUSTOMERS] {
        assert_eq!(report.state_of(id), Some(NodeState::Succeeded), "{id}");
    }
    assert_eq!(report.group_state(ecommerce::LOAD_GROUP), Some(NodeState::Succeeded));
    assert_eq!(report.group_state(ecommerce::TRANSFORM_GROUP), Some(NodeState::Failed));
}

#[tokio::test]
async fn rerunning_the_pipeline_is_idempotent() {
    let fx = fixture(0);
    write_products(&fx.root);
    let (trigger, def) = ecommerce::definition(&fx.config, fx.collaborators.clone()).unwrap();
    let engine = EltFlow::new()
        .db_path(&fx.config.run.store_path)
        .add_pipeline(trigger, def);

    let first = engine.run_once(ecommerce::PIPELINE).await.unwrap();
    let products = fx.warehouse.read_rows("products").await.unwrap();
    let second = engine.run_once(ecommerce::PIPELINE).await.unwrap();

    assert!(first.success && second.success);
    assert_eq!(fx.warehouse.read_rows("products").await.unwrap(), products);
    assert_eq!(fx.warehouse.row_count("orders").await.unwrap(), 2);

    let store = Store::open(&fx.config.run.store_path).unwrap();
    let runs = store.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == "succeeded" && r.pipeline == ecommerce::PIPELINE));
    assert_eq!(store.task_runs_for(&second.run_id).unwrap().len(), second.nodes.len());
}
