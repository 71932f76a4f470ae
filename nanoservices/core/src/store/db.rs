use std::path::Path;

use rusqlite::{params, Connection};

use crate::scheduler::report::RunReport;

/// SQLite-backed store for pipeline run history.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_runs (
                id TEXT PRIMARY KEY,
                pipeline TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER
            );
            CREATE TABLE IF NOT EXISTS task_runs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES pipeline_runs(id),
                node TEXT NOT NULL,
                group_name TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                duration_ms INTEGER,
                error TEXT,
                root_cause TEXT,
                position INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_pipeline ON pipeline_runs(pipeline);
            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status);
            CREATE INDEX IF NOT EXISTS idx_task_runs_run_id ON task_runs(run_id);",
        )?;
        Ok(())
    }

    /// Record a new pipeline run as started.
    pub fn insert_pipeline_run(
        &self,
        id: &str,
        pipeline: &str,
        trigger_type: &str,
        started_at: &str,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO pipeline_runs (id, pipeline, trigger_type, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![id, pipeline, trigger_type, started_at],
        )?;
        Ok(())
    }

    /// Complete a pipeline run.
    pub fn complete_pipeline_run(
        &self,
        id: &str,
        status: &str,
        finished_at: &str,
        duration_ms: i64,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE pipeline_runs SET status = ?2, finished_at = ?3, duration_ms = ?4 WHERE id = ?1",
            params![id, status, finished_at, duration_ms],
        )?;
        Ok(())
    }

    /// Persist a finished run and every node in it. A run that was never
    /// inserted as running is created here.
    pub fn record_report(&self, report: &RunReport, trigger_type: &str) -> Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO pipeline_runs (id, pipeline, trigger_type, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![
                report.run_id,
                report.pipeline,
                trigger_type,
                report.started_at.to_rfc3339()
            ],
        )?;
        tx.execute(
            "UPDATE pipeline_runs SET status = ?2, finished_at = ?3, duration_ms = ?4 WHERE id = ?1",
            params![
                report.run_id,
                run_status(report),
                report.finished_at.to_rfc3339(),
                report.duration_ms()
            ],
        )?;
        for (position, node) in report.nodes.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO task_runs
                 (id, run_id, node, group_name, status, attempts, started_at, duration_ms, error, root_cause, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    format!("{}/{}", report.run_id, node.id),
                    report.run_id,
                    node.id,
                    node.group,
                    node.state.as_str(),
                    node.attempts,
                    node.started_at.map(|t| t.to_rfc3339()),
                    node.duration_ms.map(|ms| ms as i64),
                    node.error,
                    node.root_cause,
                    position as i64,
                ],
            )?;
        }
        tx.commit()
    }

    /// Mark in-flight runs as crashed (for crash recovery on startup).
    pub fn mark_inflight_as_crashed(&self) -> Result<usize, rusqlite::Error> {
        let count = self.conn.execute(
            "UPDATE pipeline_runs SET status = 'crashed' WHERE status = 'running'",
            [],
        )?;
        Ok(count)
    }

    /// Get recent pipeline runs.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRunRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pipeline, trigger_type, status, started_at, finished_at, duration_ms
             FROM pipeline_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PipelineRunRow {
                id: row.get(0)?,
                pipeline: row.get(1)?,
                trigger_type: row.get(2)?,
                status: row.get(3)?,
                started_at: row.get(4)?,
                finished_at: row.get(5)?,
                duration_ms: row.get(6)?,
            })
        })?;
        rows.collect()
    }

    /// Get node runs for a specific pipeline run, in execution order.
    pub fn task_runs_for(&self, run_id: &str) -> Result<Vec<TaskRunRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, node, group_name, status, attempts, started_at, duration_ms, error, root_cause
             FROM task_runs WHERE run_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(TaskRunRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                node: row.get(2)?,
                group: row.get(3)?,
                status: row.get(4)?,
                attempts: row.get(5)?,
                started_at: row.get(6)?,
                duration_ms: row.get(7)?,
                error: row.get(8)?,
                root_cause: row.get(9)?,
            })
        })?;
        rows.collect()
    }
}

fn run_status(report: &RunReport) -> &'static str {
    if report.success {
        "succeeded"
    } else if report.cancelled {
        "cancelled"
    } else {
        "failed"
    }
}

#[derive(Debug)]
pub struct PipelineRunRow {
    pub id: String,
    pub pipeline: String,
    pub trigger_type: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug)]
pub struct TaskRunRow {
    pub id: String,
    pub run_id: String,
    pub node: String,
    pub group: Option<String>,
    pub status: String,
    pub attempts: u32,
    pub started_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub root_cause: Option<String>,
}
