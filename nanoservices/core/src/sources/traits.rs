use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};

/// A source that pulls a snapshot of records from one external system.
#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable name for logging and errors
    fn name(&self) -> &str;

    async fn extract(&self) -> EltResult<RecordSet>;
}

/// A database that answers SQL queries with records.
#[async_trait]
pub trait RelationalSource: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, sql: &str) -> EltResult<RecordSet>;
}

/// A bucket of named objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    async fn exists(&self, path: &str) -> EltResult<bool>;

    /// Raw object bytes. An absent object is a `Connector` error.
    async fn get(&self, path: &str) -> EltResult<Vec<u8>>;

    /// Fetch and decode an object by extension: `.json` arrays,
    /// `.jsonl`/`.ndjson` lines, anything else as CSV with a header.
    async fn fetch(&self, path: &str) -> EltResult<RecordSet> {
        let bytes = self.get(path).await?;
        parse_object(path, &bytes).map_err(|e| match e {
            e @ Error::Connector { .. } => e,
            other => Error::connector(self.name(), format!("cannot parse `{path}`: {other}")),
        })
    }
}

pub fn parse_object(path: &str, bytes: &[u8]) -> EltResult<RecordSet> {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        RecordSet::from_json_array(bytes)
    } else if lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
        RecordSet::from_ndjson(bytes)
    } else {
        RecordSet::from_csv(bytes)
    }
}
