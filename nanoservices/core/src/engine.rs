use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use eltflow_utils::error::Error;
use eltflow_utils::EltResult;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use uuid::Uuid;

use crate::events::interval::spawn_interval_trigger;
use crate::events::trigger::{Trigger, TriggerEvent};
use crate::metrics;
use crate::pipeline::PipelineDef;
use crate::scheduler::report::RunReport;
use crate::scheduler::runner::Executor;
use crate::store::db::Store;

/// Pending trigger events before producers block.
const EVENT_CAPACITY: usize = 256;

struct Registered {
    trigger: Trigger,
    def: Arc<PipelineDef>,
}

/// Top-level orchestrator. Users register pipelines and call run().
pub struct EltFlow {
    pipelines: Vec<Registered>,
    db_path: Option<PathBuf>,
}

impl Default for EltFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl EltFlow {
    pub fn new() -> Self {
        Self {
            pipelines: Vec::new(),
            db_path: None,
        }
    }

    /// Set the path for the SQLite run-history database. Defaults to in-memory.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Add a pipeline (trigger + definition).
    pub fn add_pipeline(mut self, trigger: Trigger, def: PipelineDef) -> Self {
        self.pipelines.push(Registered {
            trigger,
            def: Arc::new(def),
        });
        self
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineDef> {
        self.find(name).map(|r| r.def.as_ref())
    }

    fn find(&self, name: &str) -> Option<&Registered> {
        self.pipelines.iter().find(|r| r.def.name == name)
    }

    fn open_store(&self) -> EltResult<Store> {
        let store = match &self.db_path {
            Some(path) => Store::open(path)?,
            None => Store::in_memory()?,
        };
        Ok(store)
    }

    /// Run one pipeline immediately and record the result.
    pub async fn run_once(&self, name: &str) -> EltResult<RunReport> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_once_with_cancel(name, cancel_rx).await
    }

    /// As [`EltFlow::run_once`], stopping early when the watch turns `true`.
    pub async fn run_once_with_cancel(&self, name: &str, cancel: watch::Receiver<bool>) -> EltResult<RunReport> {
        let registered = self
            .find(name)
            .ok_or_else(|| Error::Config(format!("unknown pipeline `{name}`")))?;
        let store = Arc::new(Mutex::new(self.open_store()?));

        let run_id = Uuid::new_v4().to_string();
        let label = Trigger::Manual.to_string();
        begin_run(&store, &run_id, &registered.def.name, &label).await;
        let report = execute(registered.def.clone(), run_id, cancel).await;
        finish_run(&store, &report, &label).await;
        Ok(report)
    }

    /// Run the orchestrator until Ctrl-C.
    pub async fn run(self) -> EltResult<()> {
        self.run_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Run with a custom shutdown signal (useful for testing).
    ///
    /// A trigger that fires while the same pipeline is still running is
    /// skipped, so runs never overlap and missed periods are not replayed.
    /// On shutdown in-flight runs are cancelled and drained before returning.
    pub async fn run_with_shutdown<F: Future>(self, shutdown: F) -> EltResult<()> {
        let store = self.open_store()?;

        // Crash recovery
        let crashed = store.mark_inflight_as_crashed()?;
        if crashed > 0 {
            tracing::warn!(count = crashed, "marked in-flight runs as crashed from previous session");
        }
        let store = Arc::new(Mutex::new(store));

        let (event_tx, mut event_rx) = mpsc::channel::<TriggerEvent>(EVENT_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut trigger_handles = Vec::new();
        let mut defs: HashMap<String, Arc<PipelineDef>> = HashMap::new();
        for registered in &self.pipelines {
            let name = registered.def.name.clone();
            match spawn_interval_trigger(name.clone(), registered.trigger.clone(), event_tx.clone()) {
                Some(handle) => {
                    tracing::info!(pipeline = %name, trigger = %registered.trigger, "pipeline scheduled");
                    trigger_handles.push(handle);
                }
                None => tracing::info!(pipeline = %name, "manual pipeline, not scheduled"),
            }
            defs.insert(name, registered.def.clone());
        }
        // Drop our copy so the channel closes once every producer stops.
        drop(event_tx);

        let mut active: HashSet<String> = HashSet::new();
        let mut runs: JoinSet<(String, RunReport)> = JoinSet::new();
        let mut events_open = true;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = event_rx.recv(), if events_open => {
                    let Some(TriggerEvent { pipeline, trigger }) = event else {
                        events_open = false;
                        continue;
                    };
                    let Some(def) = defs.get(&pipeline) else {
                        tracing::warn!(pipeline = %pipeline, "trigger for unknown pipeline");
                        continue;
                    };
                    if !active.insert(pipeline.clone()) {
                        tracing::warn!(pipeline = %pipeline, "previous run still active, skipping trigger");
                        continue;
                    }
                    let run_id = Uuid::new_v4().to_string();
                    let label = trigger.to_string();
                    begin_run(&store, &run_id, &pipeline, &label).await;
                    let def = def.clone();
                    let cancel = cancel_rx.clone();
                    runs.spawn(async move { (label, execute(def, run_id, cancel).await) });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    on_finished(&store, &mut active, joined).await;
                }
            }
        }

        tracing::info!(active = runs.len(), "shutdown requested, cancelling active runs");
        let _ = cancel_tx.send(true);
        for handle in trigger_handles {
            handle.abort();
        }
        while let Some(joined) = runs.join_next().await {
            on_finished(&store, &mut active, joined).await;
        }

        tracing::info!("eltflow shutdown complete");
        Ok(())
    }
}

async fn execute(def: Arc<PipelineDef>, run_id: String, cancel: watch::Receiver<bool>) -> RunReport {
    Executor::new(def.name.clone(), def.executor)
        .run_with_id(run_id, &def.plan, cancel)
        .await
}

async fn begin_run(store: &Mutex<Store>, run_id: &str, pipeline: &str, trigger: &str) {
    let started_at = Utc::now().to_rfc3339();
    if let Err(e) = store.lock().await.insert_pipeline_run(run_id, pipeline, trigger, &started_at) {
        tracing::error!(run = %run_id, error = %e, "failed to record run start");
    }
}

async fn finish_run(store: &Mutex<Store>, report: &RunReport, trigger: &str) {
    metrics::record_report(report);
    if let Err(e) = store.lock().await.record_report(report, trigger) {
        tracing::error!(run = %report.run_id, error = %e, "failed to record run report");
    }
    if report.success {
        tracing::info!(run = %report.run_id, pipeline = %report.pipeline, "pipeline run succeeded");
    } else {
        tracing::error!(
            run = %report.run_id,
            pipeline = %report.pipeline,
            cancelled = report.cancelled,
            "pipeline run failed\n{}",
            report.summary()
        );
    }
}

async fn on_finished(
    store: &Mutex<Store>,
    active: &mut HashSet<String>,
    joined: Result<(String, RunReport), JoinError>,
) {
    match joined {
        Ok((trigger, report)) => {
            active.remove(&report.pipeline);
            finish_run(store, &report, &trigger).await;
        }
        Err(e) => tracing::error!(error = %e, "pipeline run task aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PipelineBuilder;
    use crate::dag::graph::DependencyGraph;
    use crate::dag::node::{task_fn, NodeOutput, TaskNode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_pipeline(trigger: Trigger, work: Duration, count: Arc<AtomicUsize>) -> (Trigger, PipelineDef) {
        let mut graph = DependencyGraph::new();
        graph.add_node(TaskNode::task(
            "tick",
            task_fn(move |_| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(work).await;
                    Ok(NodeOutput::Empty)
                }
            }),
        ));
        PipelineBuilder::new("counting")
            .trigger(trigger)
            .graph(graph)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn engine_runs_and_shuts_down() {
        let count = Arc::new(AtomicUsize::new(0));
        let (trigger, def) = counting_pipeline(
            Trigger::Interval(Duration::from_millis(50)),
            Duration::from_millis(1),
            count.clone(),
        );

        EltFlow::new()
            .add_pipeline(trigger, def)
            .run_with_shutdown(tokio::time::sleep(Duration::from_millis(275)))
            .await
            .unwrap();

        // ticks at 50, 100, 150, 200 and 250
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_triggers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("runs.db");
        let count = Arc::new(AtomicUsize::new(0));
        let (trigger, def) = counting_pipeline(
            Trigger::Interval(Duration::from_millis(50)),
            Duration::from_millis(120),
            count.clone(),
        );

        EltFlow::new()
            .db_path(&db)
            .add_pipeline(trigger, def)
            .run_with_shutdown(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        // runs start at 50 and 200; ticks at 100 and 150 land mid-run
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let store = Store::open(&db).unwrap();
        let runs = store.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status != "running"));
    }

    #[tokio::test]
    async fn run_once_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("runs.db");
        let count = Arc::new(AtomicUsize::new(0));
        let (trigger, def) = counting_pipeline(Trigger::Manual, Duration::ZERO, count.clone());
        let engine = EltFlow::new().db_path(&db).add_pipeline(trigger, def);

        let report = engine.run_once("counting").await.unwrap();
        assert!(report.success);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let store = Store::open(&db).unwrap();
        let runs = store.recent_runs(10).unwrap();
        assert_eq!(runs[0].id, report.run_id);
        assert_eq!(runs[0].status, "succeeded");
        assert_eq!(runs[0].trigger_type, "manual");
        assert_eq!(store.task_runs_for(&report.run_id).unwrap()[0].node, "tick");

        let err = engine.run_once("missing").await.unwrap_err();
        assert!(err.to_string().contains("unknown pipeline"));
    }

    #[tokio::test]
    async fn manual_pipelines_are_not_scheduled() {
        let count = Arc::new(AtomicUsize::new(0));
        let (trigger, def) = counting_pipeline(Trigger::Manual, Duration::ZERO, count.clone());

        EltFlow::new()
            .add_pipeline(trigger, def)
            .run_with_shutdown(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
