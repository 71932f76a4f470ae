use std::path::PathBuf;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use serde_json::{Map, Number, Value};

use super::traits::{RelationalSource, Source};

/// Relational source over a SQLite database file, opened read-only per query.
#[derive(Debug, Clone)]
pub struct SqlSource {
    name: String,
    path: PathBuf,
    query: Option<String>,
}

impl SqlSource {
    /// Accepts a plain path or a `sqlite://` connection string.
    pub fn new(conn: &str) -> Self {
        let path = conn
            .strip_prefix("sqlite://")
            .or_else(|| conn.strip_prefix("sqlite:"))
            .unwrap_or(conn);
        Self {
            name: "sql".to_string(),
            path: PathBuf::from(path),
            query: None,
        }
    }

    pub fn name_as(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Query used when the source is driven through [`Source::extract`].
    pub fn with_query(mut self, sql: impl Into<String>) -> Self {
        self.query = Some(sql.into());
        self
    }
}

/// Map one SQLite row to a JSON object keyed by column name.
pub(crate) fn row_to_json(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Map<String, Value>> {
    let mut object = Map::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect()),
        };
        object.insert(column.clone(), value);
    }
    Ok(object)
}

fn run_query(path: &PathBuf, sql: &str) -> rusqlite::Result<Vec<Value>> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI)?;
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt.query_map([], |row| row_to_json(row, &columns).map(Value::Object))?;
    rows.collect()
}

#[async_trait]
impl RelationalSource for SqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, sql: &str) -> EltResult<RecordSet> {
        let path = self.path.clone();
        let owned = sql.to_string();
        let rows = tokio::task::spawn_blocking(move || run_query(&path, &owned))
            .await
            .map_err(|e| Error::connector(&self.name, e))?
            .map_err(|e| Error::connector(&self.name, e))?;

        let records = RecordSet::from_json_rows(&rows)?;
        tracing::info!(source = %self.name, rows = records.num_rows(), "sql query complete");
        Ok(records)
    }
}

#[async_trait]
impl Source for SqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> EltResult<RecordSet> {
        let sql = self
            .query
            .as_deref()
            .ok_or_else(|| Error::Config(format!("`{}` has no query configured", self.name)))?;
        self.query(sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed(path: &std::path::Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (customer_id INTEGER, email TEXT, score REAL);
             INSERT INTO customers VALUES (1, 'a@shop.io', 4.5), (2, NULL, 3.0), (3, 'c@shop.io', NULL);",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn query_maps_rows_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shop.db");
        seed(&db);

        let source = SqlSource::new(&format!("sqlite://{}", db.display())).name_as("postgres");
        let records = source.query("SELECT * FROM customers ORDER BY customer_id").await.unwrap();
        assert_eq!(records.num_rows(), 3);

        let rows = records.to_json_rows().unwrap();
        assert_eq!(rows[0]["email"], json!("a@shop.io"));
        assert_eq!(rows[1]["email"], Value::Null);
        assert_eq!(rows[2]["score"], Value::Null);
    }

    #[tokio::test]
    async fn bad_query_is_connector_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shop.db");
        seed(&db);

        let err = SqlSource::new(db.to_str().unwrap())
            .query("SELECT * FROM missing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connector { .. }));
    }

    #[tokio::test]
    async fn missing_database_is_connector_error() {
        let err = SqlSource::new("/nonexistent/dir/shop.db")
            .with_query("SELECT 1")
            .extract()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connector { .. }));
    }
}
