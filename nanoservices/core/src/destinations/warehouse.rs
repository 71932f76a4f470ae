use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Transaction};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::traits::{LoadOptions, LoadSink, SchemaInference, TableHandle, WriteMode};
use crate::sources::sql::row_to_json;

/// Warehouse sink backed by SQLite. Tables live under `dataset.table` names
/// and are reported as `project.dataset.table`.
#[derive(Clone)]
pub struct WarehouseSink {
    name: String,
    project: String,
    dataset: String,
    options: LoadOptions,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for WarehouseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseSink")
            .field("project", &self.project)
            .field("dataset", &self.dataset)
            .field("options", &self.options)
            .finish()
    }
}

impl WarehouseSink {
    pub fn open(path: impl AsRef<Path>, project: &str, dataset: &str) -> EltResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self::with_connection(conn, project, dataset))
    }

    pub fn in_memory(project: &str, dataset: &str) -> EltResult<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?, project, dataset))
    }

    fn with_connection(conn: Connection, project: &str, dataset: &str) -> Self {
        Self {
            name: "warehouse".to_string(),
            project: project.to_string(),
            dataset: dataset.to_string(),
            options: LoadOptions::default(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    pub fn table_id(&self, table: &str) -> String {
        format!("{}.{}.{}", self.project, self.dataset, table)
    }

    fn physical(&self, table: &str) -> String {
        format!("{}.{}", self.dataset, table)
    }

    /// Rows of `table` in insertion order.
    pub async fn read_rows(&self, table: &str) -> EltResult<Vec<Map<String, Value>>> {
        let sql = format!("SELECT * FROM {} ORDER BY rowid", quote(&self.physical(table)));
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let rows = stmt.query_map([], |row| row_to_json(row, &names))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn row_count(&self, table: &str) -> EltResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote(&self.physical(table)));
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> EltResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> EltResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::task(format!("warehouse worker failed: {e}")))?
    }
}

fn lock(conn: &Mutex<Connection>) -> EltResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::load("warehouse", "connection lock poisoned"))
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "REAL",
        _ => "TEXT",
    }
}

/// Convert one Arrow column into SQLite values, nulls preserved.
fn column_values(array: &ArrayRef) -> EltResult<Vec<SqlValue>> {
    let len = array.len();
    let values = match array.data_type() {
        DataType::Null => vec![SqlValue::Null; len],
        DataType::Boolean => {
            let bools = array.as_boolean();
            (0..len)
                .map(|i| match bools.is_null(i) {
                    true => SqlValue::Null,
                    false => SqlValue::Integer(bools.value(i) as i64),
                })
                .collect()
        }
        t if sql_type(t) == "INTEGER" => {
            let cast = cast(array, &DataType::Int64)?;
            let ints = cast.as_primitive::<Int64Type>();
            ints.iter()
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Integer))
                .collect()
        }
        t if sql_type(t) == "REAL" => {
            let cast = cast(array, &DataType::Float64)?;
            let floats = cast.as_primitive::<Float64Type>();
            floats
                .iter()
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Real))
                .collect()
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            let cast = cast(array, &DataType::Utf8)?;
            let strings = cast.as_string::<i32>();
            strings
                .iter()
                .map(|v| v.map_or(SqlValue::Null, |s| SqlValue::Text(s.to_string())))
                .collect()
        }
        _ => {
            let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())?;
            (0..len)
                .map(|i| match array.is_null(i) {
                    true => SqlValue::Null,
                    false => SqlValue::Text(formatter.value(i).to_string()),
                })
                .collect()
        }
    };
    Ok(values)
}

fn table_columns(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.collect()
}

fn insert_all(tx: &Transaction<'_>, table: &str, records: &RecordSet) -> EltResult<()> {
    let Some(schema) = records.schema() else {
        return Ok(());
    };
    let columns: Vec<String> = schema.fields().iter().map(|f| quote(f.name())).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    let mut stmt = tx.prepare(&sql)?;

    for batch in records.batches() {
        let values = batch
            .columns()
            .iter()
            .map(column_values)
            .collect::<EltResult<Vec<_>>>()?;
        for row in 0..batch.num_rows() {
            stmt.execute(params_from_iter(values.iter().map(|col| &col[row])))?;
        }
    }
    Ok(())
}

/// Truncate: write into a fresh staging table, then replace the target's
/// rows from it. Everything happens in one transaction, so readers never see
/// a partial table. The target is only recreated when its columns change,
/// which keeps views defined over it valid.
fn load_truncate(conn: &mut Connection, target: &str, records: &RecordSet, fixed: bool) -> EltResult<()> {
    let tx = conn.transaction()?;
    let existing = table_columns(&tx, target)?;

    let Some(schema) = records.schema() else {
        if !existing.is_empty() {
            tx.execute(&format!("DELETE FROM {}", quote(target)), [])?;
        }
        tx.commit()?;
        return Ok(());
    };

    let names: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
    if fixed {
        check_fixed(target, &existing, &names)?;
    }

    let staging = format!("{target}__staging_{}", Uuid::new_v4().simple());
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| format!("{} {}", quote(f.name()), sql_type(f.data_type())))
        .collect();
    tx.execute_batch(&format!("CREATE TABLE {} ({})", quote(&staging), columns.join(", ")))?;
    insert_all(&tx, &staging, records)?;

    let target_q = quote(target);
    if existing == names {
        tx.execute(&format!("DELETE FROM {target_q}"), [])?;
    } else {
        // No `ALTER TABLE .. RENAME`: SQLite re-validates every view on rename.
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {target_q}; CREATE TABLE {target_q} ({});",
            columns.join(", ")
        ))?;
    }
    let column_list = names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ");
    tx.execute_batch(&format!(
        "INSERT INTO {target_q} ({column_list}) SELECT {column_list} FROM {staging_q}; DROP TABLE {staging_q};",
        staging_q = quote(&staging),
    ))?;
    tx.commit()?;
    Ok(())
}

fn load_append(conn: &mut Connection, target: &str, records: &RecordSet, fixed: bool) -> EltResult<()> {
    let Some(schema) = records.schema() else {
        return Ok(());
    };
    let tx = conn.transaction()?;
    let existing = table_columns(&tx, target)?;
    let names: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();

    if fixed || !existing.is_empty() {
        check_fixed(target, &existing, &names)?;
    } else {
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| format!("{} {}", quote(f.name()), sql_type(f.data_type())))
            .collect();
        tx.execute_batch(&format!("CREATE TABLE {} ({})", quote(target), columns.join(", ")))?;
    }
    insert_all(&tx, target, records)?;
    tx.commit()?;
    Ok(())
}

fn check_fixed(target: &str, existing: &[String], incoming: &[String]) -> EltResult<()> {
    if existing.is_empty() {
        return Err(Error::load(target, "table does not exist and schema inference is fixed"));
    }
    if existing != incoming {
        return Err(Error::load(
            target,
            format!("column mismatch: table has {existing:?}, records have {incoming:?}"),
        ));
    }
    Ok(())
}

#[async_trait]
impl LoadSink for WarehouseSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, records: &RecordSet, destination: &str) -> EltResult<TableHandle> {
        let table_id = self.table_id(destination);
        let target = self.physical(destination);
        let options = self.options;
        let rows = records.num_rows();
        let batch = records.clone();

        let result = self
            .blocking(move |conn| {
                let fixed = options.schema_inference == SchemaInference::Fixed;
                match options.write_mode {
                    WriteMode::Truncate => load_truncate(conn, &target, &batch, fixed),
                    WriteMode::Append => load_append(conn, &target, &batch, fixed),
                }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(table = %table_id, rows, mode = ?options.write_mode, "warehouse load complete");
                Ok(TableHandle { table_id, rows })
            }
            Err(e @ Error::Load { .. }) => Err(e),
            Err(e) => Err(Error::load(table_id, e)),
        }
    }
}
