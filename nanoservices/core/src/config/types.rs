use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::config::loader::parse_duration;
use crate::destinations::traits::{SchemaInference, WriteMode};

/// Everything the ecommerce pipeline needs to reach its systems.
#[derive(Debug, Clone, Deserialize)]
pub struct EltConfig {
    pub project_id: String,
    pub dataset: String,
    pub tables: TableNames,
    pub dbt: DbtConfig,
    pub api: ApiConfig,
    pub postgres: PostgresConfig,
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub sensor: SensorSettings,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub run: RunSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableNames {
    pub products: String,
    pub customers: String,
    pub orders: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbtConfig {
    pub project_dir: PathBuf,
    pub profiles_dir: PathBuf,
    #[serde(default = "default_selector")]
    pub selector: String,
    #[serde(default = "default_dbt_program")]
    pub program: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// SQLite path or `sqlite://` URI.
    pub conn: String,
    #[serde(default = "default_query")]
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    #[serde(default = "default_object")]
    pub object: String,
    /// When set, the bucket is a directory under this root instead of Cloud Storage.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorSettings {
    #[serde(default = "default_poke_interval", deserialize_with = "duration")]
    pub poke_interval: Duration,
    #[serde(default = "default_poke_timeout", deserialize_with = "duration")]
    pub timeout: Duration,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            poke_interval: default_poke_interval(),
            timeout: default_poke_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default = "default_warehouse_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub schema_inference: SchemaInference,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: default_warehouse_path(),
            write_mode: WriteMode::default(),
            schema_inference: SchemaInference::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    /// Extra attempts for extract and load nodes.
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay", deserialize_with = "duration")]
    pub retry_delay: Duration,
    /// Interval between scheduled runs; daily at UTC midnight when unset.
    #[serde(default, deserialize_with = "optional_duration")]
    pub schedule_every: Option<Duration>,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_delay: default_retry_delay(),
            schedule_every: None,
            store_path: default_store_path(),
            max_active_tasks: default_max_active_tasks(),
        }
    }
}

pub(crate) fn default_selector() -> String {
    "+mart_ecom_sales_summary".to_string()
}

pub(crate) fn default_dbt_program() -> String {
    "dbt".to_string()
}

pub(crate) fn default_endpoint() -> String {
    "/ecom_orders_api/orders".to_string()
}

pub(crate) fn default_query() -> String {
    "SELECT * FROM customers".to_string()
}

pub(crate) fn default_object() -> String {
    "ecom_raw/products.csv".to_string()
}

pub(crate) fn default_poke_interval() -> Duration {
    Duration::from_secs(30)
}

pub(crate) fn default_poke_timeout() -> Duration {
    Duration::from_secs(600)
}

pub(crate) fn default_warehouse_path() -> PathBuf {
    PathBuf::from("warehouse.db")
}

pub(crate) fn default_retry_delay() -> Duration {
    Duration::from_secs(300)
}

pub(crate) fn default_store_path() -> PathBuf {
    PathBuf::from("eltflow.db")
}

pub(crate) fn default_max_active_tasks() -> usize {
    16
}

/// Durations are written as `30s`, `10m`, `1h`, `500ms` or bare seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn optional_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    duration(deserializer).map(Some)
}
