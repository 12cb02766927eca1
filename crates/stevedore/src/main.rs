//! stevedore — bucket-oriented file replication service.
//!
//! `run` serves the replication engine until SIGINT; the remaining
//! commands operate on the queue database directly and assume no other
//! process owns it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stevedore_db::QueueDb;
use stevedore_engine::events::{EventBroadcaster, ProgressCollector, ProgressFlusher};
use stevedore_engine::manager::{BucketManager, SHUTDOWN_BOUND};
use stevedore_engine::scheduler::SchedulerContext;
use stevedore_engine::translog::TracingTransferLog;
use stevedore_protocol::events::ServiceEvent;
use stevedore_protocol::types::{ConflictAction, NewBucket, ScopeStats};
use stevedore_protocol::ServiceConfig;
use stevedore_scout::ScanConfig;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "stevedore", about = "Bucket-oriented file replication service")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the queue database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Verbose console logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the replication service until interrupted
    Run {
        /// Rescan every bucket's sources before serving
        #[arg(long)]
        scan_on_start: bool,
    },

    /// Enumerate a bucket's sources and seed the queue
    Scan {
        /// Bucket name
        bucket: String,

        /// Seed rows whose destination already exists with equal size
        /// directly as completed (skips the hash check; opt-in)
        #[arg(long)]
        precomplete_existing: bool,
    },

    /// Print queue statistics
    Stats {
        /// Limit to one bucket
        bucket: Option<String>,
    },

    /// Manage buckets
    Bucket {
        #[command(subcommand)]
        action: BucketCommand,
    },

    /// Resolve conflicted rows
    Resolve {
        /// Bucket name
        bucket: String,

        /// overwrite | skip
        #[arg(long)]
        action: String,

        /// Resolve a single row instead of every conflict in the bucket
        #[arg(long)]
        file: Option<i64>,
    },

    /// Requeue errored rows
    Retry {
        /// Bucket name
        bucket: String,

        /// Retry a single row instead of every error in the bucket
        #[arg(long)]
        file: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum BucketCommand {
    /// Create a bucket
    Add {
        #[arg(long)]
        name: String,

        /// Source roots, in drain order (repeatable)
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        #[arg(long)]
        destination: String,

        /// Worker cap (defaults to the configured workerDefaultCount)
        #[arg(long, default_value_t = 0)]
        workers: u32,
    },

    /// List buckets
    List,

    /// Delete a stopped bucket and its queue rows
    Remove {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    stevedore_logging::init_logging("stevedore", cli.verbose)?;

    let mut config = ServiceConfig::load_or_default(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }

    let db = QueueDb::open(&config.database_path).await?;

    match cli.command {
        Command::Run { scan_on_start } => run_service(db, config, scan_on_start).await,
        Command::Scan {
            bucket,
            precomplete_existing,
        } => {
            let bucket = db.get_bucket_by_name(&bucket).await?;
            let mut scan_config = ScanConfig::from_service(&config);
            scan_config.precomplete_existing = precomplete_existing;
            let summary = stevedore_scout::scan_bucket(&db, &bucket, &scan_config).await?;
            println!(
                "scanned {}: {} seen, {} queued, {} skipped",
                bucket.name, summary.files_seen, summary.files_queued, summary.skipped
            );
            Ok(())
        }
        Command::Stats { bucket } => print_stats(&db, bucket.as_deref()).await,
        Command::Bucket { action } => handle_bucket(&db, &config, action).await,
        Command::Resolve {
            bucket,
            action,
            file,
        } => {
            let Some(action) = ConflictAction::parse(&action) else {
                bail!("unknown resolve action (expected overwrite or skip)");
            };
            let bucket = db.get_bucket_by_name(&bucket).await?;
            let resolved = match file {
                Some(row) => db.resolve_conflict(bucket.id, row, action).await? as u64,
                None => db.resolve_conflicts_bulk(Some(bucket.id), action).await?,
            };
            println!("resolved {resolved} conflicted row(s)");
            Ok(())
        }
        Command::Retry { bucket, file } => {
            let bucket = db.get_bucket_by_name(&bucket).await?;
            let retried = match file {
                Some(row) => db.retry_error(bucket.id, row).await? as u64,
                None => db.retry_errors_bulk(Some(bucket.id)).await?,
            };
            println!("requeued {retried} errored row(s)");
            Ok(())
        }
    }
}

async fn run_service(db: QueueDb, config: ServiceConfig, scan_on_start: bool) -> Result<()> {
    let events = EventBroadcaster::new();
    let progress = ProgressCollector::new();
    let _flusher = ProgressFlusher::spawn(progress.clone(), events.clone());

    let ctx = SchedulerContext {
        db: db.clone(),
        events: events.clone(),
        progress,
        log: Arc::new(TracingTransferLog),
        hash_algorithm: config.hash_algorithm,
        copy_buffer_size: config.copy_buffer_size,
        worker_max_count: config.worker_max_count,
    };
    let manager = BucketManager::new(db.clone(), ctx, config.clone()).await?;

    if scan_on_start {
        let scan_config = ScanConfig::from_service(&config);
        for bucket in db.list_buckets().await? {
            let summary = stevedore_scout::scan_bucket(&db, &bucket, &scan_config).await?;
            events.publish(ServiceEvent::ScanFinished {
                bucket_id: bucket.id,
                files_seen: summary.files_seen,
                files_queued: summary.files_queued,
            });
            manager.wake(bucket.id).await;
        }
    }

    // Debug trace of the event stream; external observers subscribe the
    // same way.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            debug!(?event, "service event");
        }
    });

    manager.restore_state().await?;
    info!("stevedore serving; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    manager.shutdown(SHUTDOWN_BOUND).await?;
    db.set_state("last_shutdown_at", &QueueDb::now_millis().to_string())
        .await?;
    Ok(())
}

async fn handle_bucket(db: &QueueDb, config: &ServiceConfig, action: BucketCommand) -> Result<()> {
    match action {
        BucketCommand::Add {
            name,
            sources,
            destination,
            workers,
        } => {
            let bucket = db
                .create_bucket(&NewBucket {
                    name,
                    source_folders: sources,
                    destination_folder: destination,
                    worker_count: config.clamp_worker_count(workers),
                })
                .await?;
            println!("created bucket {} (id {})", bucket.name, bucket.id);
            Ok(())
        }
        BucketCommand::List => {
            for bucket in db.list_buckets().await? {
                println!(
                    "{:>4}  {:<20} {:<8} workers={} sources={} -> {}",
                    bucket.id,
                    bucket.name,
                    bucket.status,
                    bucket.worker_count,
                    bucket.source_folders.len(),
                    bucket.destination_folder
                );
            }
            Ok(())
        }
        BucketCommand::Remove { name } => {
            let bucket = db.get_bucket_by_name(&name).await?;
            db.delete_bucket(bucket.id).await?;
            println!("deleted bucket {name}");
            Ok(())
        }
    }
}

async fn print_stats(db: &QueueDb, bucket: Option<&str>) -> Result<()> {
    let scope = match bucket {
        Some(name) => {
            let bucket = db.get_bucket_by_name(name).await?;
            db.bucket_stats(bucket.id).await
        }
        None => db.stats().await.total,
    };
    print_scope(&scope);
    Ok(())
}

fn print_scope(scope: &ScopeStats) {
    for status in stevedore_protocol::FileStatus::ALL {
        let cell = scope.get(status);
        println!(
            "{:<12} count={:<8} bytes={}",
            status.as_str(),
            cell.count,
            cell.total_size
        );
    }
}
