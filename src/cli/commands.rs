//! CLI command definitions for quiz-forge.
//!
//! Each subcommand is one process role: `produce` submits a job, `work` runs
//! a worker loop, `aggregate` merges a finished job into a deck and `status`
//! prints a queue snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregationSummary, AggregatorOptions, ResultAggregator};
use crate::config::AppConfig;
use crate::extract::PdfPageSource;
use crate::generation::build_generator;
use crate::manifest::{ManifestRef, ManifestStore};
use crate::producer::TaskProducer;
use crate::queue::{HttpQueueGateway, QueueGateway, QueueStatus};
use crate::worker::{StopReason, TaskWorker, WorkerOptions, WorkerStats};

/// Flashcard generation over a shared task queue.
#[derive(Parser)]
#[command(name = "quiz-forge")]
#[command(about = "Turn PDF documents into flashcard decks using a distributed task queue")]
#[command(version)]
#[command(
    long_about = "quiz-forge splits a PDF into one task per page, lets any number of workers generate question/answer pairs for those pages, and merges the results into an Anki-importable CSV deck.\n\nExample usage:\n  quiz-forge produce lecture.pdf\n  quiz-forge work <QUEUE_ID>\n  quiz-forge aggregate --job-id <JOB_ID>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./config.yaml when present).
    #[arg(short, long, global = true, env = "QUIZ_FORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Print machine-readable JSON summaries.
    #[arg(short = 'j', long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Split a PDF into page tasks and record the job manifest.
    Produce(ProduceArgs),

    /// Claim tasks from a queue and generate flashcards for each page.
    Work(WorkArgs),

    /// Wait for a job to finish and merge its results into a deck.
    #[command(alias = "agg")]
    Aggregate(AggregateArgs),

    /// Print a progress snapshot for a queue.
    Status(StatusArgs),
}

/// Arguments for `quiz-forge produce`.
#[derive(Parser, Debug)]
pub struct ProduceArgs {
    /// Path to the PDF document.
    pub source: PathBuf,

    /// Queue name (defaults to `pdf-` plus the first 8 characters of the job id).
    #[arg(short = 'q', long)]
    pub queue_name: Option<String>,
}

/// Arguments for `quiz-forge work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Queue to consume.
    pub queue_id: String,

    /// Worker identifier used in logs (defaults to `worker-{pid}`).
    #[arg(short = 'w', long)]
    pub worker_id: Option<String>,

    /// Exit once the queue has no task left instead of polling forever.
    #[arg(long)]
    pub drain: bool,
}

/// Arguments for `quiz-forge aggregate`.
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("job").required(true).args(["job_id", "queue_id"])))]
pub struct AggregateArgs {
    /// Job to aggregate.
    #[arg(long)]
    pub job_id: Option<String>,

    /// Queue whose job should be aggregated.
    #[arg(long)]
    pub queue_id: Option<String>,

    /// Deck path (defaults to `{output_dir}/{job_id}_deck.csv`).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// Arguments for `quiz-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Queue to inspect.
    pub queue_id: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Produce(args) => run_produce_command(&config, args, cli.json).await,
        Commands::Work(args) => run_work_command(&config, args, cli.json).await,
        Commands::Aggregate(args) => run_aggregate_command(&config, args, cli.json).await,
        Commands::Status(args) => run_status_command(&config, args, cli.json).await,
    }
}

fn parse_id(raw: &str, what: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid {what} '{raw}'"))
}

fn gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn QueueGateway>> {
    let gateway = HttpQueueGateway::from_config(&config.queue_service)
        .context("failed to construct queue client")?;
    Ok(Arc::new(gateway))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize summary")?;
    println!("{json}");
    Ok(())
}

/// Resolves on Ctrl-C. Never resolves if the signal handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C, interrupts are disabled");
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Produce
// ============================================================================

async fn run_produce_command(config: &AppConfig, args: ProduceArgs, json: bool) -> anyhow::Result<()> {
    let manifests = ManifestStore::new(&config.storage.metadata_dir);
    let producer = TaskProducer::new(
        gateway(config)?,
        Arc::new(PdfPageSource::new(&config.storage.pages_dir)),
        manifests.clone(),
    );

    let manifest = producer
        .submit(&args.source, args.queue_name.as_deref())
        .await
        .with_context(|| format!("failed to submit {}", args.source.display()))?;

    if json {
        return print_json(&manifest);
    }

    println!("✓ Job submitted");
    println!("  Job id:    {}", manifest.job_id);
    println!("  Queue id:  {}", manifest.queue_id);
    println!("  Tasks:     {}/{}", manifest.task_ids.len(), manifest.total_units);
    if manifest.skipped_units() > 0 {
        println!("  Skipped:   {}", manifest.skipped_units());
    }
    println!("  Manifest:  {}", manifests.path_for(manifest.job_id).display());
    Ok(())
}

// ============================================================================
// Work
// ============================================================================

#[derive(Debug, Serialize)]
struct WorkSummary<'a> {
    worker_id: &'a str,
    queue_id: Uuid,
    stop_reason: StopReason,
    stats: &'a WorkerStats,
}

async fn run_work_command(config: &AppConfig, args: WorkArgs, json: bool) -> anyhow::Result<()> {
    let queue_id = parse_id(&args.queue_id, "queue id")?;
    let generator = build_generator(&config.llm).context("failed to set up generation")?;

    let mut options = WorkerOptions::from_config(config).with_drain(args.drain);
    if let Some(worker_id) = args.worker_id {
        options = options.with_worker_id(worker_id);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        ctrl_c().await;
        info!("Received Ctrl-C, finishing current task");
        let _ = shutdown_tx.send(());
    });

    let worker = TaskWorker::new(queue_id, gateway(config)?, generator, options, shutdown_rx);
    let worker_id = worker.id().to_string();
    let (stats, reason) = worker
        .run()
        .await
        .with_context(|| format!("worker {worker_id} stopped"))?;

    if json {
        return print_json(&WorkSummary {
            worker_id: &worker_id,
            queue_id,
            stop_reason: reason,
            stats: &stats,
        });
    }

    println!("✓ Worker {} stopped ({:?})", worker_id, reason);
    println!("  Claimed:          {}", stats.claimed);
    println!("  Succeeded:        {}", stats.succeeded);
    println!("  Failed:           {}", stats.failed);
    println!("  Report failures:  {}", stats.report_failures);
    Ok(())
}

// ============================================================================
// Aggregate
// ============================================================================

async fn run_aggregate_command(
    config: &AppConfig,
    args: AggregateArgs,
    json: bool,
) -> anyhow::Result<()> {
    let reference = match (&args.job_id, &args.queue_id) {
        (Some(job_id), _) => ManifestRef::Job(parse_id(job_id, "job id")?),
        (None, Some(queue_id)) => ManifestRef::Queue(parse_id(queue_id, "queue id")?),
        (None, None) => anyhow::bail!("either --job-id or --queue-id is required"),
    };

    let aggregator = ResultAggregator::new(
        gateway(config)?,
        ManifestStore::new(&config.storage.metadata_dir),
        AggregatorOptions::from_config(config).with_output_path(args.output),
    );

    let summary = tokio::select! {
        result = aggregator.aggregate(reference) => result.context("aggregation failed")?,
        _ = ctrl_c() => {
            warn!("Interrupted while waiting for the job to finish");
            anyhow::bail!("aggregation interrupted");
        }
    };

    if json {
        return print_json(&summary);
    }
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &AggregationSummary) {
    println!("✓ Deck written: {}", summary.deck_path.display());
    println!("  Deck:           {}", summary.deck_name);
    println!("  Source:         {}", summary.source_name);
    println!("  Job id:         {}", summary.job_id);
    println!("  Cards:          {}", summary.items);
    println!(
        "  Pages:          {}/{} ({:.1}%)",
        summary.units_represented,
        summary.expected,
        summary.success_ratio * 100.0
    );
    if summary.failed_units > 0 {
        println!("  Failed pages:   {}", summary.failed_units);
    }
    if summary.missing_results > 0 {
        println!("  Missing:        {}", summary.missing_results);
    }
    if summary.bad_payloads > 0 {
        println!("  Bad payloads:   {}", summary.bad_payloads);
    }
}

// ============================================================================
// Status
// ============================================================================

/// Human label for a status snapshot.
fn state_label(status: &QueueStatus) -> &'static str {
    if status.pending_count > 0 || status.has_pending {
        "In Progress"
    } else if status.completed_count > 0 {
        "Complete"
    } else {
        "Idle"
    }
}

#[derive(Debug, Serialize)]
struct StatusSummary {
    queue_id: Uuid,
    pending: u64,
    completed: u64,
    progress_percent: f64,
    state: &'static str,
}

async fn run_status_command(config: &AppConfig, args: StatusArgs, json: bool) -> anyhow::Result<()> {
    let queue_id = parse_id(&args.queue_id, "queue id")?;
    let status = gateway(config)?
        .get_status(queue_id)
        .await
        .with_context(|| format!("failed to fetch status of queue {queue_id}"))?;

    let summary = StatusSummary {
        queue_id,
        pending: status.pending_count,
        completed: status.completed_count,
        progress_percent: status.progress_percent(),
        state: state_label(&status),
    };

    if json {
        return print_json(&summary);
    }

    println!("Queue {}", summary.queue_id);
    println!("  Pending:    {}", summary.pending);
    println!("  Completed:  {}", summary.completed);
    println!("  Progress:   {:.1}%", summary.progress_percent);
    println!("  State:      {}", summary.state);
    Ok(())
}
