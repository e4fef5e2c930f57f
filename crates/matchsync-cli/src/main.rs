use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "matchsync")]
#[command(about = "Scheduled match ingestion and detail reconciliation")]
struct Cli {
    /// Source id from sources.yaml; defaults to MATCHSYNC_SOURCE.
    #[arg(long, global = true)]
    source: Option<String>,
    /// Enable info-level logging; overrides MATCHSYNC_LOG.
    #[arg(long, global = true)]
    log: Option<bool>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run population and reconciliation on their intervals until Ctrl-C.
    Run,
    /// Ingest one batch and exit.
    Populate,
    /// Backfill detail for incomplete records once and exit.
    Reconcile,
    /// Print the highest stored sequence number.
    Cursor,
}

fn init_tracing(enabled: bool) {
    let default_level = if enabled { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let pipeline = matchsync_sync::pipeline_from_env()?;
    init_tracing(cli.log.unwrap_or(pipeline.config().logging_enabled));
    let source = cli.source.as_deref();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let mut scheduler = pipeline.build_scheduler(source)?;
            scheduler.run_until(shutdown_signal()).await;
            for task in scheduler.stats() {
                info!(task = %task.name, runs = task.runs, failures = task.failures, "task totals");
            }
        }
        Commands::Populate => {
            let summary = pipeline.population(source)?.run_once().await?;
            println!(
                "populate complete: source={} cursor_before={:?} fetched={} kept={} inserted={} duplicates={}",
                summary.source_id,
                summary.cursor_before,
                summary.fetched,
                summary.kept,
                summary.inserted,
                summary.duplicates
            );
        }
        Commands::Reconcile => {
            let summary = pipeline.reconciler(source)?.run_once().await?;
            println!(
                "reconcile complete: scanned={} merged={} skipped={} failed={}",
                summary.scanned, summary.merged, summary.skipped, summary.failed
            );
        }
        Commands::Cursor => {
            let source_id = pipeline.source(source)?.source_id.clone();
            match pipeline.current_cursor(source).await? {
                Some(seq) => println!("{source_id}: {seq}"),
                None => println!("{source_id}: no sequence numbers stored"),
            }
        }
    }

    Ok(())
}
