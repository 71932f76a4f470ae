use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::types::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("missing required setting `{0}`")]
    Missing(String),
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },
}

/// Load the config from a YAML file.
pub fn load_file(path: impl AsRef<Path>) -> Result<EltConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse the config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<EltConfig, ConfigError> {
    let config: EltConfig = serde_yaml::from_str(yaml)?;
    non_zero("sensor.poke_interval", config.sensor.poke_interval)?;
    non_zero("sensor.timeout", config.sensor.timeout)?;
    if let Some(every) = config.run.schedule_every {
        non_zero("run.schedule_every", every)?;
    }
    Ok(config)
}

fn non_zero(key: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Build the config from process environment variables.
pub fn from_env() -> Result<EltConfig, ConfigError> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build the config from any key lookup; empty values count as unset.
pub fn from_lookup<F>(lookup: F) -> Result<EltConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let required = |key: &str| get(key).ok_or_else(|| ConfigError::Missing(key.to_string()));
    let parsed = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
        match get(key) {
            Some(raw) => parse_duration(&raw).map_err(|message| ConfigError::Invalid {
                key: key.to_string(),
                message,
            }),
            None => Ok(default),
        }
    };
    let invalid = |key: &str, e: &dyn std::fmt::Display| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    };

    let warehouse = WarehouseConfig {
        path: get("WAREHOUSE_PATH").map(PathBuf::from).unwrap_or_else(default_warehouse_path),
        write_mode: match get("WRITE_MODE") {
            Some(raw) => raw.parse().map_err(|e| invalid("WRITE_MODE", &e))?,
            None => Default::default(),
        },
        schema_inference: match get("SCHEMA_INFERENCE") {
            Some(raw) => raw.parse().map_err(|e| invalid("SCHEMA_INFERENCE", &e))?,
            None => Default::default(),
        },
    };

    let run = RunSettings {
        retries: match get("RETRIES") {
            Some(raw) => raw.trim().parse().map_err(|e| invalid("RETRIES", &e))?,
            None => 0,
        },
        retry_delay: parsed("RETRY_DELAY", default_retry_delay())?,
        schedule_every: get("SCHEDULE_EVERY")
            .map(|raw| parse_duration(&raw))
            .transpose()
            .map_err(|message| ConfigError::Invalid {
                key: "SCHEDULE_EVERY".to_string(),
                message,
            })?
            .map(|every| non_zero("SCHEDULE_EVERY", every))
            .transpose()?,
        store_path: get("ELTFLOW_DB").map(PathBuf::from).unwrap_or_else(default_store_path),
        max_active_tasks: match get("MAX_ACTIVE_TASKS") {
            Some(raw) => raw.trim().parse().map_err(|e| invalid("MAX_ACTIVE_TASKS", &e))?,
            None => default_max_active_tasks(),
        },
    };

    Ok(EltConfig {
        project_id: required("GCP_PROJECT_ID")?,
        dataset: required("BQ_DATASET")?,
        tables: TableNames {
            products: required("BQ_TABLE_ECOM_PRODUCTS")?,
            customers: required("BQ_TABLE_ECOM_CUSTOMERS_ECOM")?,
            orders: required("BQ_TABLE_ECOM_ORDERS")?,
        },
        dbt: DbtConfig {
            project_dir: PathBuf::from(required("DBT_PROJECT_DIR")?),
            profiles_dir: PathBuf::from(required("DBT_PROFILES_DIR")?),
            selector: get("DBT_SELECTOR").unwrap_or_else(default_selector),
            program: get("DBT_PROGRAM").unwrap_or_else(default_dbt_program),
        },
        api: ApiConfig {
            base_url: required("MOCKAPI_BASE_URL")?,
            endpoint: get("MOCKAPI_ENDPOINT").unwrap_or_else(default_endpoint),
            token: get("MOCKAPI_TOKEN"),
        },
        postgres: PostgresConfig {
            conn: required("POSTGRES_CONN")?,
            query: get("POSTGRES_QUERY").unwrap_or_else(default_query),
        },
        object_store: ObjectStoreConfig {
            bucket: required("GCS_BUCKET")?,
            object: get("GCS_OBJECT").unwrap_or_else(default_object),
            root: get("OBJECT_STORE_ROOT").map(PathBuf::from),
            token: get("GCS_TOKEN"),
        },
        sensor: SensorSettings {
            poke_interval: non_zero("POLL_INTERVAL", parsed("POLL_INTERVAL", default_poke_interval())?)?,
            timeout: non_zero("POLL_TIMEOUT", parsed("POLL_TIMEOUT", default_poke_timeout())?)?,
        },
        warehouse,
        run,
    })
}

/// Parse `500ms`, `30s`, `10m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("`{raw}` is not a duration"))?;
    let seconds = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("`{raw}` is too large"))
    };
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => seconds(60),
        "h" => seconds(3600),
        other => Err(format!("unknown duration unit `{other}` in `{raw}`")),
    }
}
