//! Tabular payload passed between nodes and handed to load sinks.
//!
//! Rows enter as JSON objects (API payloads, SQL rows) or CSV bytes (object
//! store files). Both paths infer an Arrow schema best-effort, so a column that
//! mixes integers and floats widens to `Float64` and a column that is entirely
//! null stays `Null`.

use std::io::Cursor;
use std::sync::Arc;

use arrow::csv::reader::Format;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow_json::reader::infer_json_schema_from_iterator;
use arrow_json::writer::{JsonArray, WriterBuilder};
use arrow_json::ReaderBuilder;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::EltResult;

const BATCH_SIZE: usize = 1024;

#[derive(Clone, Debug, Default)]
pub struct RecordSet(pub Arc<Vec<RecordBatch>>);

impl RecordSet {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        RecordSet(Arc::new(batches))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> &Vec<RecordBatch> {
        &self.0
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| (*shared).clone())
    }

    pub fn schema(&self) -> Option<SchemaRef> {
        self.0.first().map(|b| b.schema())
    }

    pub fn num_rows(&self) -> usize {
        self.0.iter().map(|b| b.num_rows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Field names of the shared schema, in column order.
    pub fn field_names(&self) -> Vec<String> {
        self.schema()
            .map(|s| s.fields().iter().map(|f| f.name().clone()).collect())
            .unwrap_or_default()
    }

    /// Build a record set from JSON objects, inferring the schema from every row.
    pub fn from_json_rows(rows: &[Value]) -> EltResult<Self> {
        if rows.is_empty() {
            return Ok(Self::empty());
        }
        if let Some(pos) = rows.iter().position(|r| !r.is_object()) {
            return Err(Error::connector(
                "json",
                format!("malformed payload: row {pos} is not an object"),
            ));
        }

        let schema = infer_json_schema_from_iterator(rows.iter().map(Ok))?;
        let mut decoder = ReaderBuilder::new(Arc::new(schema))
            .with_batch_size(BATCH_SIZE)
            .build_decoder()?;

        let mut batches = Vec::new();
        for chunk in rows.chunks(BATCH_SIZE) {
            decoder.serialize(chunk)?;
            if let Some(batch) = decoder.flush()? {
                batches.push(batch);
            }
        }
        Ok(Self::new(batches))
    }

    /// Parse a JSON document holding an array of objects.
    pub fn from_json_array(bytes: &[u8]) -> EltResult<Self> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Array(rows) => Self::from_json_rows(&rows),
            other => Err(Error::connector(
                "json",
                format!("malformed payload: expected an array, got {}", json_kind(&other)),
            )),
        }
    }

    /// Parse newline-delimited JSON, skipping blank lines.
    pub fn from_ndjson(bytes: &[u8]) -> EltResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::connector("ndjson", format!("malformed payload: {e}")))?;
        let rows = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_json_rows(&rows)
    }

    /// Parse CSV with a header row. Empty fields decode as null.
    pub fn from_csv(bytes: &[u8]) -> EltResult<Self> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::empty());
        }
        let format = Format::default().with_header(true);
        let (schema, _) = format.infer_schema(Cursor::new(bytes), None)?;
        let reader = arrow::csv::ReaderBuilder::new(Arc::new(schema))
            .with_header(true)
            .with_batch_size(BATCH_SIZE)
            .build(Cursor::new(bytes))?;
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(batches))
    }

    /// Row view of the set. Null values are kept as explicit `null` entries.
    pub fn to_json_rows(&self) -> EltResult<Vec<Map<String, Value>>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        let mut writer = WriterBuilder::new()
            .with_explicit_nulls(true)
            .build::<_, JsonArray>(Vec::new());
        let refs: Vec<&RecordBatch> = self.0.iter().collect();
        writer.write_batches(&refs)?;
        writer.finish()?;
        let buf = writer.into_inner();
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&buf)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
