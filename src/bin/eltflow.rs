//! Operator CLI: run the `elt_ecommerce` pipeline once, serve it on its
//! schedule, inspect run history, or print the execution plan.

use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use eltflow::core::config::{self, EltConfig};
use eltflow::core::engine::EltFlow;
use eltflow::core::logging;
use eltflow::core::metrics;
use eltflow::core::pipeline::{ecommerce, Collaborators};
use eltflow::core::store::Store;

#[derive(Debug, Parser)]
#[command(name = "eltflow", version, about = "Extract/load/transform orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and exit non-zero if it failed.
    Run(RunArgs),
    /// Run the pipeline on its schedule until Ctrl-C.
    Serve(ServeArgs),
    /// Show recent runs from the history database.
    History(HistoryArgs),
    /// Print the validated execution order.
    Plan(ConfigArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// YAML configuration file. Environment variables are used when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Address for the Prometheus `/metrics` exporter.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    /// Run-history database.
    #[arg(long, default_value = "eltflow.db")]
    db: PathBuf,
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// Show node details for one run.
    #[arg(long)]
    run: Option<String>,
}

fn load_config(path: Option<&Path>) -> Result<EltConfig> {
    let config = match path {
        Some(path) => config::load_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => config::from_env().context("reading configuration from the environment")?,
    };
    Ok(config)
}

fn engine(config: &EltConfig) -> Result<EltFlow> {
    let collaborators = Collaborators::from_config(config)?;
    let (trigger, def) = ecommerce::definition(config, collaborators)?;
    Ok(EltFlow::new()
        .db_path(&config.run.store_path)
        .add_pipeline(trigger, def))
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.config.as_deref())?;
    let engine = engine(&config)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let report = engine.run_once_with_cancel(ecommerce::PIPELINE, cancel_rx).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }
    if !report.success {
        bail!("pipeline `{}` failed", report.pipeline);
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = load_config(args.config.config.as_deref())?;
    let engine = engine(&config)?;

    let exporter = match args.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).with_context(|| format!("binding {addr}"))?;
            Some(metrics::start_exporter(listener))
        }
        None => None,
    };

    engine.run().await?;

    if let Some((handle, shutdown)) = exporter {
        let _ = shutdown.send(());
        let _ = handle.await;
    }
    Ok(())
}

fn history(args: HistoryArgs) -> Result<()> {
    let store = Store::open(&args.db).with_context(|| format!("opening {}", args.db.display()))?;

    if let Some(run_id) = args.run {
        for task in store.task_runs_for(&run_id)? {
            println!(
                "{:<45} {:<16} attempts={} {}",
                task.node,
                task.status,
                task.attempts,
                task.root_cause.unwrap_or_default()
            );
        }
        return Ok(());
    }

    for run in store.recent_runs(args.limit)? {
        let duration = run.duration_ms.map(|ms| format!("{ms}ms")).unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<16} {:<10} {:<14} {}  {}",
            run.started_at, run.pipeline, run.status, run.trigger_type, duration, run.id
        );
    }
    Ok(())
}

fn plan(args: ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let collaborators = Collaborators::from_config(&config)?;
    let (trigger, def) = ecommerce::definition(&config, collaborators)?;

    println!("{} ({trigger})", def.name);
    for id in &def.plan.order {
        let mut deps: Vec<&str> = def
            .plan
            .dependencies
            .get(id)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default();
        deps.sort_by_key(|dep| def.plan.position(dep));
        let upstream = deps.join(", ");
        if upstream.is_empty() {
            println!("  {id}");
        } else {
            println!("  {id} <- {upstream}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Serve(args) => serve(args).await,
        Commands::History(args) => history(args),
        Commands::Plan(args) => plan(args),
    }
}
