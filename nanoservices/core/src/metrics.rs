use std::convert::Infallible;
use std::net::TcpListener;

use eltflow_utils::EltResult;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tokio::task::JoinHandle;

use crate::scheduler::report::RunReport;
use crate::scheduler::state::NodeState;

struct Metrics {
    registry: Registry,
    pipeline_runs: CounterVec,
    pipeline_failures: CounterVec,
    pipeline_duration_ms: HistogramVec,
    task_attempts: CounterVec,
    task_failures: CounterVec,
}

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("eltflow".to_string()), None)?;
        let pipeline_runs = CounterVec::new(
            Opts::new("pipeline_runs_total", "Total pipeline runs"),
            &["pipeline_name"],
        )?;
        let pipeline_failures = CounterVec::new(
            Opts::new("pipeline_failures_total", "Total failed pipeline runs"),
            &["pipeline_name"],
        )?;
        let pipeline_duration_ms = HistogramVec::new(
            HistogramOpts::new("pipeline_duration_ms", "Pipeline run duration in milliseconds")
                .buckets(vec![100.0, 1_000.0, 10_000.0, 60_000.0, 300_000.0, 1_800_000.0]),
            &["pipeline_name"],
        )?;
        let task_attempts = CounterVec::new(
            Opts::new("task_attempts_total", "Node attempts, retries included"),
            &["pipeline_name", "node"],
        )?;
        let task_failures = CounterVec::new(
            Opts::new("task_failures_total", "Nodes that ended FAILED"),
            &["pipeline_name", "node"],
        )?;

        registry.register(Box::new(pipeline_runs.clone()))?;
        registry.register(Box::new(pipeline_failures.clone()))?;
        registry.register(Box::new(pipeline_duration_ms.clone()))?;
        registry.register(Box::new(task_attempts.clone()))?;
        registry.register(Box::new(task_failures.clone()))?;

        Ok(Self {
            registry,
            pipeline_runs,
            pipeline_failures,
            pipeline_duration_ms,
            task_attempts,
            task_failures,
        })
    }
}

// Global registry and metrics are initialized lazily.
static METRICS: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::register() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::error!(error = %e, "failed to register metrics");
        None
    }
});

/// Observe a pipeline run duration in milliseconds.
pub fn observe_duration(pipeline_name: &str, duration_ms: f64) {
    if let Some(m) = METRICS.as_ref() {
        m.pipeline_duration_ms.with_label_values(&[pipeline_name]).observe(duration_ms);
    }
}

/// Increment the run counter for a pipeline.
pub fn inc_run(pipeline_name: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.pipeline_runs.with_label_values(&[pipeline_name]).inc();
    }
}

/// Increment the failure counter for a pipeline.
pub fn inc_failure(pipeline_name: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.pipeline_failures.with_label_values(&[pipeline_name]).inc();
    }
}

/// Record everything a finished run reports: the run itself, its duration,
/// and per-node attempts and failures.
pub fn record_report(report: &RunReport) {
    let pipeline = report.pipeline.as_str();
    inc_run(pipeline);
    if !report.success {
        inc_failure(pipeline);
    }
    observe_duration(pipeline, report.duration_ms() as f64);

    let Some(m) = METRICS.as_ref() else { return };
    for node in &report.nodes {
        if node.attempts > 0 {
            m.task_attempts
                .with_label_values(&[pipeline, node.id.as_str()])
                .inc_by(f64::from(node.attempts));
        }
        if node.state == NodeState::Failed {
            m.task_failures.with_label_values(&[pipeline, node.id.as_str()]).inc();
        }
    }
}

/// Gather metrics as text in Prometheus exposition format.
///
/// ```no_run
/// use eltflow_core::metrics;
/// metrics::inc_run("example_pipeline");
/// let body = metrics::gather_text();
/// println!("metrics:\n{}", body);
/// ```
pub fn gather_text() -> String {
    let Some(m) = METRICS.as_ref() else { return String::new() };
    let mut buffer = vec![];
    if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response = Response::new(Body::from(gather_text()));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(response)
        }
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

/// Serve `/metrics` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, shutdown: F) -> EltResult<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let server = Server::from_tcp(listener)
        .map_err(std::io::Error::other)?
        .serve(make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(handle))
        }));

    tracing::info!(%addr, "metrics exporter listening");
    server
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(std::io::Error::other)?;
    tracing::info!("metrics exporter stopped");
    Ok(())
}

/// Spawn the exporter on the current runtime. Sending on (or dropping) the
/// returned sender stops it.
pub fn start_exporter(listener: TcpListener) -> (JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = rx.await;
        };
        if let Err(e) = serve(listener, shutdown).await {
            tracing::error!(error = %e, "metrics exporter failed");
        }
    });
    (handle, tx)
}
