//! `verve`: inspect and drive the local-first sync core from a terminal.

mod error;
mod setup;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use verve_config::Config;
use verve_sync::{Context, QueueWorker, ops, status};

#[derive(Parser, Debug)]
#[command(name = "verve", version, about = "Local-first file cache and sync")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "VERVE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show queued, failed and dirty counts
    Status {
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Push queued changes to their backends
    Sync {
        /// Keep running: drain on every change and poll backends for theirs
        #[arg(short, long)]
        watch: bool,
    },
    /// Requeue failed entries (all of them, or one by id)
    Retry { id: Option<i64> },
    /// Drop a failed entry without retrying it
    Discard { id: i64 },
    /// List cached files of a workspace (the first configured one by default)
    Ls {
        dir: Option<String>,
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Import a workspace's backend contents into the cache
    Hydrate {
        #[arg(short, long)]
        workspace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let ctx = setup::context(&config).await?;
    match cli.command {
        Command::Status { workspace } => {
            let status = status::sync_status(&ctx, workspace.as_deref()).await.or_raise(|| ErrorKind::Sync)?;
            println!("pending:    {}", status.pending);
            println!("processing: {}", status.processing);
            println!("failed:     {}", status.failed);
            println!("dirty:      {}", status.dirty);
            if let Some(last_error) = status.last_error {
                println!("last error: {last_error}");
            }
        },
        Command::Sync { watch: false } => {
            let report = verve_sync::process_pending_queue_once(&ctx).await.or_raise(|| ErrorKind::Sync)?;
            println!(
                "completed {}, retrying {}, failed {} ({} conflicts)",
                report.completed, report.retried, report.failed, report.conflicts
            );
        },
        Command::Sync { watch: true } => watch(ctx, &config).await?,
        Command::Retry { id } => {
            let requeued = status::retry_failed(&ctx, id).await.or_raise(|| ErrorKind::Sync)?;
            println!("requeued {requeued} entries");
        },
        Command::Discard { id } => match status::discard_failed(&ctx, id).await.or_raise(|| ErrorKind::Sync)? {
            true => println!("discarded entry {id}"),
            false => println!("no failed entry {id}"),
        },
        Command::Ls { dir, workspace } => {
            let workspace = ctx.workspace(workspace.as_deref()).await.or_raise(|| ErrorKind::Sync)?;
            let files = ops::list_files(&ctx, dir.as_deref(), workspace.scope()).await.or_raise(|| ErrorKind::Sync)?;
            for file in files {
                let marker = if file.dirty { "*" } else { " " };
                let suffix = if file.is_dir() { "/" } else { "" };
                println!("{marker} {}{suffix}", file.path);
            }
        },
        Command::Hydrate { workspace } => {
            let workspace = ctx.workspace(workspace.as_deref()).await.or_raise(|| ErrorKind::Sync)?;
            let report = verve_sync::hydrate_workspace(&ctx, &workspace).await.or_raise(|| ErrorKind::Sync)?;
            println!(
                "imported {}, unchanged {}, diverged {}, unreachable {}",
                report.imported, report.unchanged, report.diverged, report.errors
            );
        },
    }
    Ok(())
}

/// Run the queue worker and one poller per backend-stored workspace until
/// interrupted.
async fn watch(ctx: Context, config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut tasks = vec![QueueWorker::new(ctx.clone(), config.sync.drain_interval()).spawn(cancel.clone())];
    for poller in verve_sync::pollers(&ctx, config.sync.poll_interval()).await {
        tasks.push(poller.spawn(cancel.clone()));
    }
    info!(tasks = tasks.len(), "watching; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.or_raise(|| ErrorKind::Sync)?;
    info!("shutting down");
    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            error!("background task ended abnormally: {err}");
        }
    }
    Ok(())
}
