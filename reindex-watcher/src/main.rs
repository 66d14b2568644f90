//! reindex-watcher - catalog reindex scheduler
//!
//! `createjob` records reindex requests, `watch` drains them into the search
//! index, and the remaining subcommands inspect or steer the job queues.
//! Every process sharing a root folder shares one SQLite database.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reindex_common::config::LoggingConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reindex_watcher::adapters::default_registry;
use reindex_watcher::config::WatcherConfig;
use reindex_watcher::models::{normalize_ids, EntityType, ReindexRequest};
use reindex_watcher::services::{DocumentStore, ElasticsearchStore, MagentoClient, SourceClient};
use reindex_watcher::{AppState, Reindexer};

/// Command-line arguments for reindex-watcher
#[derive(Parser, Debug)]
#[command(name = "reindex-watcher")]
#[command(about = "Catalog reindex scheduler and bulk importer")]
#[command(version)]
struct Cli {
    /// Folder holding reindexer.db and reindexer.toml
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request a reindex of some ids (or everything) of an entity
    Createjob {
        #[command(flatten)]
        target: Target,

        /// low, normal, medium, high or critical
        #[arg(long)]
        priority: Option<String>,
    },

    /// Drain reindex jobs until interrupted
    Watch {
        #[arg(long)]
        max_active_jobs: Option<usize>,

        /// Only drain jobs of this store
        #[arg(long)]
        store_code: Option<String>,

        /// Serve the control API on this port
        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Print job counts
    Health,

    /// Stop claiming new jobs (in-flight jobs finish)
    Pause,

    Resume,

    /// Print the job state of pending ids
    Status {
        #[command(flatten)]
        target: Target,
    },

    /// Move stuck active jobs back to the queue
    Requeue,

    /// Delete stuck active jobs
    Remove,

    /// Delete waiting jobs and forget all pending ids
    Clear,

    /// Import directly, without creating a job
    Import {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args, Debug)]
struct Target {
    #[arg(long)]
    entity: String,

    /// Comma-separated ids; omit for everything
    #[arg(long)]
    ids: Option<String>,

    #[arg(long)]
    store_code: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WatcherConfig::resolve(cli.root_folder.as_deref())
        .context("Failed to resolve configuration")?;
    init_tracing(&config.settings.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        root_folder = %config.root_folder.display(),
        "reindex-watcher starting"
    );

    std::fs::create_dir_all(&config.root_folder).with_context(|| {
        format!("Failed to create root folder {}", config.root_folder.display())
    })?;
    let pool = reindex_common::db::init_database(&config.database_path)
        .await
        .context("Failed to open database")?;

    let store_filter = match &cli.command {
        Command::Watch { store_code, .. } => store_code.clone(),
        _ => None,
    };
    let mut settings = config.settings.clone();
    if let Command::Watch {
        max_active_jobs: Some(n),
        ..
    } = &cli.command
    {
        settings.worker.max_active_jobs = *n;
    }

    let source: Arc<dyn SourceClient> =
        Arc::new(MagentoClient::new(&settings.source, &settings.default_store_code)?);
    let document_store: Arc<dyn DocumentStore> =
        Arc::new(ElasticsearchStore::new(&settings.document_store)?);
    let reindexer = Reindexer::new(
        pool,
        &settings,
        default_registry(source),
        document_store,
        store_filter,
    );
    let default_store = settings.default_store_code.as_str();

    match cli.command {
        Command::Createjob { target, priority } => {
            let store_code = target.store_code.as_deref().unwrap_or(default_store);
            let request = ReindexRequest::parse(
                &target.entity,
                target.ids.as_deref(),
                store_code,
                priority.as_deref(),
            )?;
            match reindexer.job_creator.create_reindex_job(&request).await? {
                Some(job_id) => println!("Created job {}", job_id),
                None => println!("All ids already pending, no job created"),
            }
        }
        Command::Watch { http_port, .. } => watch(reindexer, http_port).await?,
        Command::Health => {
            let health = reindexer.worker.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Pause => reindexer.worker.pause().await?,
        Command::Resume => reindexer.worker.resume().await?,
        Command::Status { target } => {
            let entity: EntityType = target.entity.parse()?;
            let store_code = target.store_code.as_deref().unwrap_or(default_store);
            let ids = parse_ids(target.ids.as_deref());
            let statuses = reindexer.worker.status(entity, store_code, &ids).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Command::Requeue => println!("Requeued {} jobs", reindexer.worker.requeue().await?),
        Command::Remove => println!("Removed {} jobs", reindexer.worker.remove().await?),
        Command::Clear => println!("Cleared {} jobs", reindexer.worker.clear().await?),
        Command::Import { target } => {
            let entity: EntityType = target.entity.parse()?;
            let store_code = target.store_code.as_deref().unwrap_or(default_store);
            let ids = parse_ids(target.ids.as_deref());
            let ids = (!ids.is_empty()).then_some(ids);
            if ids.is_none() && entity.requires_ids() {
                bail!("entity '{}' requires --ids", entity);
            }
            let summary = reindexer.executor.run(entity, store_code, ids).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn parse_ids(csv: Option<&str>) -> Vec<String> {
    normalize_ids(csv.map(|csv| csv.split(',').collect::<Vec<_>>()).unwrap_or_default())
}

/// Log level from RUST_LOG, else the configured level; optional log file
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("reindex_watcher={0},reindex_common={0},tower_http=info", logging.level))
    });

    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = logging
        .file
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Run the worker until a shutdown signal or a watchdog stall
async fn watch(reindexer: Reindexer, http_port: Option<u16>) -> Result<()> {
    let shutdown = CancellationToken::new();

    let watchdog = reindexer.watchdog();
    let stalled = watchdog.stalled();
    let watchdog_task = watchdog.spawn(shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let server_task = match http_port {
        Some(port) => {
            let app = reindex_watcher::build_router(AppState::new(
                reindexer.worker.clone(),
                reindexer.events.clone(),
            ));
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("Failed to bind control API address")?;
            info!(%addr, "Control API listening");
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let worker = reindexer.worker.clone();
    let result = tokio::select! {
        result = worker.run(shutdown.clone()) => result.map_err(anyhow::Error::from),
        _ = stalled.cancelled() => {
            error!("Worker stalled, exiting so the supervisor can restart it");
            Err(anyhow::anyhow!("worker stalled"))
        }
    };

    shutdown.cancel();
    if let Err(e) = watchdog_task.await {
        warn!(error = %e, "Watchdog task ended abnormally");
    }
    if let Some(server) = server_task {
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "Control API server error"),
            Err(e) => warn!(error = %e, "Control API task ended abnormally"),
            Ok(Ok(())) => {}
        }
    }

    info!("Watcher shutdown complete");
    result
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
