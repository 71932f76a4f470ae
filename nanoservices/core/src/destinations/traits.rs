use std::str::FromStr;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};
use serde::{Deserialize, Serialize};

/// Where a load landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHandle {
    pub table_id: String,
    pub rows: usize,
}

/// A destination that writes a record set into a named table.
///
/// In truncate mode a successful `load` leaves `destination` holding exactly
/// `records`; a failed one leaves the previous content untouched. Loading the
/// same set twice yields the same table.
#[async_trait]
pub trait LoadSink: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, records: &RecordSet, destination: &str) -> EltResult<TableHandle>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Truncate,
    Append,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaInference {
    /// Table schema follows the loaded records.
    #[default]
    Auto,
    /// Target table must already exist with the same columns.
    Fixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub schema_inference: SchemaInference,
}

impl FromStr for WriteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" | "write_truncate" => Ok(WriteMode::Truncate),
            "append" | "write_append" => Ok(WriteMode::Append),
            other => Err(Error::Config(format!("unknown write mode `{other}`"))),
        }
    }
}

impl FromStr for SchemaInference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "autodetect" => Ok(SchemaInference::Auto),
            "fixed" => Ok(SchemaInference::Fixed),
            other => Err(Error::Config(format!("unknown schema inference `{other}`"))),
        }
    }
}
