use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgqueue::broker::{AmqpBroker, MessageBroker};
use imgqueue::config::Config;
use imgqueue::enqueue::{Enqueuer, NewJob};
use imgqueue::models::Operation;
use imgqueue::processor::JobProcessor;
use imgqueue::requests::{PgRequestStore, RequestStore, StatusSink};
use imgqueue::storage;
use imgqueue::transform::ImageProcessor;
use imgqueue::worker::Worker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "imgqueue")]
#[command(about = "Queue-driven image compression and conversion")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume jobs until SIGINT or SIGTERM.
    Worker,
    /// Upload an image and queue a job for it.
    Submit {
        /// Image file to upload.
        path: PathBuf,
        #[arg(long, value_parser = parse_operation)]
        operation: Operation,
        /// Target width; required for compression.
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        user: Option<String>,
    },
}

fn parse_operation(input: &str) -> std::result::Result<Operation, String> {
    input.parse().map_err(|_| {
        format!(
            "Invalid operation '{}'. Expected compression or conversion",
            input
        )
    })
}

/// The same record store viewed as a status sink and as a full store.
fn record_store<S>(store: S) -> (Arc<dyn StatusSink>, Arc<dyn RequestStore>)
where
    S: RequestStore + 'static,
{
    let store = Arc::new(store);
    let sink: Arc<dyn StatusSink> = store.clone();
    let store: Arc<dyn RequestStore> = store;
    (sink, store)
}

async fn open_store(config: &Config) -> Result<(Arc<dyn StatusSink>, Arc<dyn RequestStore>)> {
    let url = config.require_database_url()?;
    let store = PgRequestStore::connect(url)
        .await
        .context("Failed to connect to request database")?;
    Ok(record_store(store))
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        cancel.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            warn!("Failed to install signal handlers, falling back to ctrl-c");
            if tokio::signal::ctrl_c().await.is_err() {
                error!("Failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Failed to listen for ctrl-c");
    }
}

async fn run_worker(config: Config) -> Result<()> {
    let storage = storage::from_config(&config.storage).await?;
    let (sink, _) = open_store(&config).await?;
    let broker = AmqpBroker::connect(&config.amqp_url)
        .await
        .context("Failed to connect to message broker")?;

    let processor = JobProcessor::new(
        storage,
        Arc::new(ImageProcessor::new(config.jpeg_quality)),
        sink,
        config.retry,
    );
    let worker = Worker::new(
        Arc::new(broker),
        Arc::new(processor),
        config.queue_name.clone(),
        config.prefetch,
    );

    let stats = worker.run(shutdown_token()).await?;
    info!(
        completed = stats.completed,
        already_done = stats.already_done,
        requeued = stats.requeued,
        rejected = stats.rejected,
        "Worker finished"
    );
    Ok(())
}

fn source_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("'{}' has no usable file name", path.display()))
}

async fn run_submit(
    config: Config,
    path: PathBuf,
    operation: Operation,
    width: Option<u32>,
    user: Option<String>,
) -> Result<()> {
    let content = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let storage = storage::from_config(&config.storage).await?;
    let (_, store) = open_store(&config).await?;
    let broker = Arc::new(
        AmqpBroker::connect(&config.amqp_url)
            .await
            .context("Failed to connect to message broker")?,
    );

    let enqueuer = Enqueuer::new(store, broker.clone(), storage, config.queue_name.clone());
    enqueuer.prepare().await?;
    let submitted = enqueuer
        .submit(NewJob {
            user_id: user,
            operation,
            source_name: source_name(&path)?,
            content,
            width,
        })
        .await;

    if let Err(e) = broker.close().await {
        warn!("Failed to close broker connection: {}", e);
    }

    let record = submitted?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imgqueue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = match args.command {
        Command::Worker => {
            info!(queue = %config.queue_name, "Starting imgqueue worker");
            run_worker(config).await
        }
        Command::Submit {
            path,
            operation,
            width,
            user,
        } => run_submit(config, path, operation, width, user).await,
    };

    if let Err(e) = outcome {
        error!("imgqueue failed: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
