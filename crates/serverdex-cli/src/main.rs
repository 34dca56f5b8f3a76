use anyhow::Result;
use clap::{Parser, Subcommand};
use serverdex_core::Source;
use serverdex_store::SyncLedger;
use serverdex_sync::{engine_from_env, maybe_build_scheduler, SyncError, SyncOptions};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "serverdex")]
#[command(about = "Server directory catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one source (registry, github, npm, community).
    Sync {
        source: String,
        #[arg(long)]
        max_pages: Option<u32>,
        /// Skip the stale lifecycle pass for this run.
        #[arg(long)]
        no_stale_cleanup: bool,
        /// Skip the low-quality heuristic filter for this run.
        #[arg(long)]
        no_quality_filter: bool,
    },
    /// Sync every source under one lock and one ledger run.
    SyncAll {
        #[arg(long)]
        max_pages: Option<u32>,
        #[arg(long)]
        no_stale_cleanup: bool,
        #[arg(long)]
        no_quality_filter: bool,
    },
    /// Show recent sync runs from the ledger.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show currently held sync locks.
    Locks,
    /// Run the cron scheduler in the foreground.
    Schedule,
}

fn apply_flags(
    mut options: SyncOptions,
    max_pages: Option<u32>,
    no_stale_cleanup: bool,
    no_quality_filter: bool,
) -> SyncOptions {
    if let Some(max_pages) = max_pages {
        options.max_pages = max_pages;
    }
    if no_stale_cleanup {
        options.cleanup_stale = false;
    }
    if no_quality_filter {
        options.quality_filter = false;
    }
    options.normalized()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let engine = engine_from_env().await?;

    match cli.command.unwrap_or(Commands::SyncAll {
        max_pages: None,
        no_stale_cleanup: false,
        no_quality_filter: false,
    }) {
        Commands::Sync {
            source,
            max_pages,
            no_stale_cleanup,
            no_quality_filter,
        } => {
            let source = Source::parse(&source)
                .ok_or_else(|| anyhow::anyhow!("unknown source: {source}"))?;
            let options = apply_flags(
                engine.default_options()?,
                max_pages,
                no_stale_cleanup,
                no_quality_filter,
            );
            match engine.run_source(source, &options).await {
                Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                Err(SyncError::AlreadyRunning {
                    lock_key,
                    locked_until,
                }) => {
                    eprintln!("sync already running for {lock_key} (locked until {locked_until:?})");
                    std::process::exit(1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::SyncAll {
            max_pages,
            no_stale_cleanup,
            no_quality_filter,
        } => {
            let options = apply_flags(
                engine.default_options()?,
                max_pages,
                no_stale_cleanup,
                no_quality_filter,
            );
            match engine.run_all(&options).await {
                Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                Err(SyncError::AlreadyRunning {
                    lock_key,
                    locked_until,
                }) => {
                    eprintln!("sync already running for {lock_key} (locked until {locked_until:?})");
                    std::process::exit(1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Runs { limit } => {
            let runs = engine.store().recent_runs(limit).await;
            if runs.degraded {
                eprintln!("warning: run ledger unavailable");
            }
            for run in runs.data {
                println!(
                    "{} {} status={} fetched={} upserted={} failed={} stale_marked={} duration_ms={}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.trigger,
                    run.status,
                    run.fetched,
                    run.upserted,
                    run.failed,
                    run.stale_marked,
                    run.duration_ms.unwrap_or(0),
                );
            }
        }
        Commands::Locks => {
            let locks = engine.store().active_locks().await;
            if locks.degraded {
                eprintln!("warning: lock table unavailable");
            }
            if locks.data.is_empty() {
                println!("no active locks");
            }
            for lock in locks.data {
                println!(
                    "{} held by {} until {}",
                    lock.lock_key, lock.holder_id, lock.locked_until
                );
            }
        }
        Commands::Schedule => {
            let engine = std::sync::Arc::new(engine);
            match maybe_build_scheduler(engine).await? {
                Some(mut scheduler) => {
                    scheduler.start().await?;
                    info!("scheduler running; press ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                    scheduler.shutdown().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set SERVERDEX_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
