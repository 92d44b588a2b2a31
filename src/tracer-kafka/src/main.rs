use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use tracer_common::{EpochMillisExtractor, PartitionNamer};
use tracer_config::TracerConfig;
use tracer_kafka::{KafkaTraceSource, TraceConsumer};
use tracer_postgres::{PgTraceStore, TableBootstrapper};

#[derive(Parser, Debug)]
#[command(name = "tracer-kafka", about = "Trace consumer: Kafka to day-partitioned PostgreSQL tables", version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TracerConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    init_logging(&config.logging.level, args.debug);

    info!("Starting trace consumer");
    info!("Kafka brokers: {}", config.kafka.bootstrap_servers);
    info!("Kafka topics: {:?}", config.kafka.topics);

    let offset = config
        .partition
        .fixed_offset()
        .ok_or_else(|| anyhow::anyhow!("Invalid partition.utc_offset_minutes"))?;

    let store = Arc::new(PgTraceStore::connect(&config.postgres).await?);

    // Today's tables must exist before the first record can be written
    let bootstrapper = TableBootstrapper::new(store.clone(), &config.bootstrap, offset);
    bootstrapper
        .ensure_window(bootstrapper.today())
        .await
        .context("Initial table bootstrap failed")?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let bootstrap_task = tokio::spawn(bootstrapper.run(shutdown_tx.subscribe()));

    let source = KafkaTraceSource::new(&config.kafka)?;
    let namer = PartitionNamer::new(Arc::new(EpochMillisExtractor), offset);
    let consumer = TraceConsumer::new(config.kafka.clone(), namer, store.clone());
    let mut handle = consumer
        .start(source)
        .ok_or_else(|| anyhow::anyhow!("Trace consumer was already started"))?;

    let exited = tokio::select! {
        _ = shutdown_signal() => None,
        result = handle.wait() => Some(result),
    };
    let result = match exited {
        Some(result) => result,
        None => handle.shutdown().await,
    };

    let _ = shutdown_tx.send(());
    let _ = bootstrap_task.await;
    store.close().await;

    match result {
        Ok(stats) => {
            info!(
                "Trace consumer exited: {} batches / {} records committed, {} batches / {} records dropped",
                stats.committed_batches,
                stats.committed_records,
                stats.dropped_batches,
                stats.dropped_records
            );
            Ok(())
        }
        Err(e) => {
            error!("Trace consumer failed: {:#}", e);
            Err(e)
        }
    }
}

fn init_logging(level: &str, debug: bool) {
    let env_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => error!("Failed to register SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
