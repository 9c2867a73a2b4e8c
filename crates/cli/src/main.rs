use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use baton_core::{Clock, InstanceId, ItemId, SystemClock};
use baton_queue::{
    Coordinator, CoordinatorHandle, LeaderElection, ProcessError, QueueCache, QueueConfig,
    QueueError, QueueItem, QueueResult, processor_fn,
};
use baton_store::FileStore;

const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "baton", version, about = "Durable batch queue shared between processes")]
struct Cli {
    /// Store directory (defaults to the platform data directory)
    #[arg(long, env = "BATON_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue stdin lines and print delivered batches as JSON lines
    Run {
        /// Exit once stdin is closed and the queue is empty
        #[arg(long)]
        drain: bool,
    },
    /// Print the persisted state of the queue (JSON)
    Status,
    /// Remove every persisted key of the queue
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    baton_observability::init();

    let cli = Cli::parse();
    let config = QueueConfig::from_env().context("invalid BATON_* configuration")?;
    let store = open_store(cli.data_dir)?;

    match cli.command.unwrap_or(Commands::Run { drain: false }) {
        Commands::Run { drain } => run(config, store, drain).await,
        Commands::Status => status(&config, store),
        Commands::Reset => {
            QueueCache::new(std::sync::Arc::new(store), &config.label, None).reset();
            tracing::info!(label = %config.label, "queue state removed");
            Ok(())
        }
    }
}

fn open_store(data_dir: Option<PathBuf>) -> anyhow::Result<FileStore> {
    match data_dir {
        Some(dir) => FileStore::open(&dir)
            .with_context(|| format!("failed to open file store at {}", dir.display())),
        None => FileStore::open_default(),
    }
}

async fn run(config: QueueConfig, store: FileStore, drain: bool) -> anyhow::Result<()> {
    let handle = Coordinator::spawn(config, store, processor_fn(print_batch))?;
    if !handle.store_is_durable() {
        tracing::warn!("store is not durable; queued items will not survive a restart");
    }

    ingest(&handle, BufReader::new(tokio::io::stdin()), drain).await
}

/// Feed `input` into the queue line by line, then release the instance
/// whether or not ingestion ended cleanly.
async fn ingest<R>(handle: &CoordinatorHandle, input: R, drain: bool) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let result = pump(handle, input, drain).await;
    shutdown(handle).await;
    result
}

async fn pump<R>(handle: &CoordinatorHandle, input: R, drain: bool) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                tracing::info!("interrupted");
                return Ok(());
            }
            line = lines.next_line(), if input_open => match line.context("failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    enqueue_line(handle, &line).await?;
                }
                None => {
                    input_open = false;
                    if drain {
                        handle.flush().await?;
                    }
                }
            },
            _ = tokio::time::sleep(DRAIN_POLL), if drain && !input_open => {
                if handle.snapshot().await?.queue_len == 0 {
                    return Ok(());
                }
            }
        }
    }
}

/// Enqueue one input line. A payload the queue rejects is logged and
/// skipped; `None` is returned for it.
async fn enqueue_line(handle: &CoordinatorHandle, line: &str) -> QueueResult<Option<ItemId>> {
    match handle.enqueue(&payload_from_line(line)).await {
        Ok(id) => Ok(Some(id)),
        Err(QueueError::Item(err)) => {
            tracing::warn!(error = %err, "skipping rejected line");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Give up the active claim if we hold it so another process can take
/// over right away, then stop.
async fn shutdown(handle: &CoordinatorHandle) {
    if handle.deactivate().await {
        tracing::info!(instance = %handle.instance_id(), "released active queue");
    } else {
        handle.destroy().await;
    }
}

async fn print_batch(batch: Vec<QueueItem>) -> Result<(), ProcessError> {
    let mut out = String::new();
    for item in &batch {
        let line = serde_json::to_string(item).map_err(|e| ProcessError::failed(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    std::io::stdout()
        .write_all(out.as_bytes())
        .and_then(|()| std::io::stdout().flush())
        .map_err(|e| ProcessError::failed(format!("stdout: {e}")))
}

fn status(config: &QueueConfig, store: FileStore) -> anyhow::Result<()> {
    let dir = store.dir().to_path_buf();
    let mut cache = QueueCache::new(std::sync::Arc::new(store), &config.label, None);
    let observer = LeaderElection::new(InstanceId::new(), config.active_queue_timeout);
    let now = SystemClock.now_ms();

    let report = json!({
        "label": config.label,
        "store": dir,
        "queue_len": cache.len(),
        "error_count": cache.error_count(),
        "backoff_deadline": cache.backoff_deadline(),
        "processing": cache.processing(),
        "owner": observer.inspect(&cache, now),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// JSON lines are enqueued as-is; anything else becomes a string payload.
fn payload_from_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}
