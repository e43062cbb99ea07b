//! github-audit CLI - Incremental audit of GitHub activity relayed to observability sinks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use github_audit::models::EXAMPLE_CONFIG;
use github_audit::{
    CheckpointStore, Config, DocumentFormatter, GithubProvider, HttpPublisherFactory,
    RateLimiter, SyncPipeline, build_tasks, start_tasks,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "github-audit")]
#[command(author = "Infernet <dev@infernet.org>")]
#[command(version)]
#[command(about = "Incremental audit of GitHub activity relayed to observability sinks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule every audit job until SIGINT/SIGTERM
    Run,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,

    /// Show the progress recorded in the checkpoint file
    Checkpoint {
        /// Checkpoint file (defaults to the one named in the config)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool, level: Option<Level>, log_path: Option<&Path>) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        level.unwrap_or(Level::INFO)
    };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path:?}"))?;
            let subscriber = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
        None => {
            tracing::subscriber::set_global_default(builder.finish())
                .context("Failed to set subscriber")?;
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load config from {path:?}"))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(config: Config) -> Result<()> {
    let formatter = Arc::new(DocumentFormatter::load_optional(
        config.formatter_file.as_deref(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new());
    let provider = Arc::new(GithubProvider::new(Arc::clone(&rate_limiter), None));

    let tasks = build_tasks(&config, provider.as_ref())
        .await
        .context("No audit job could be scheduled")?;

    let store = Arc::new(CheckpointStore::open(&config.checkpoint_file));
    let pipeline = Arc::new(SyncPipeline::new(
        provider,
        Arc::new(HttpPublisherFactory),
        Arc::clone(&store),
        formatter,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown requested");
            cancel.cancel();
        });
    }

    let flush_interval = Duration::from_secs(config.checkpoint_interval_secs.max(1));
    start_tasks(cancel, tasks, pipeline, store, flush_interval).await;

    let stats = rate_limiter.stats();
    info!(
        requests = stats.total_requests,
        rate_limited = stats.total_limited,
        waited_secs = stats.total_wait_secs,
        credentials = stats.credentials_tracked,
        "GitHub API usage"
    );
    info!("Stopped; in-flight passes were not waited for");
    Ok(())
}

fn print_summary(config: &Config) {
    info!("Configuration is valid");
    info!("  Checkpoint: {:?} every {}s", config.checkpoint_file, config.checkpoint_interval_secs);
    for job in &config.audit_jobs {
        info!(
            "  Job {}: {} every {}s, branches [{}] -> [{}]",
            job.name,
            job.task_id(),
            job.cadence().as_secs(),
            job.repo_config.branches.join(", "),
            job.output.target_name.join(", ")
        );
    }
    for target in &config.targets {
        info!("  Target {} ({})", target.name, target.target_type);
    }
}

fn print_checkpoint(path: &Path) -> Result<()> {
    let records = CheckpointStore::load_file(path)
        .with_context(|| format!("Failed to read checkpoint {path:?}"))?;

    println!("\n=== Checkpoint {path:?} ===");
    if records.is_empty() {
        println!("No tasks recorded");
    }
    for (task_id, record) in &records {
        println!("{task_id}");
        match record.last_run_time {
            Some(at) => println!("  Last run:    {at}"),
            None => println!("  Last run:    never completed"),
        }
        println!("  Last PR:     #{}", record.last_pr_number);
        println!("  Last issue:  {}", record.last_issue_time);
        for (branch, at) in &record.last_commit_time {
            println!("  Commits {branch}: {at}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Example => {
            println!("{EXAMPLE_CONFIG}");
        }

        Commands::Validate => {
            setup_logging(cli.verbose, None, None)?;
            let config = load_config(&cli.config)?;
            print_summary(&config);
        }

        Commands::Checkpoint { file } => {
            let path = match file {
                Some(path) => path,
                None => load_config(&cli.config)?.checkpoint_file,
            };
            print_checkpoint(&path)?;
        }

        Commands::Run => {
            let config = load_config(&cli.config)?;
            setup_logging(
                cli.verbose,
                config.tracing_level(),
                config.log_path.as_deref(),
            )?;
            info!(
                config = ?cli.config,
                jobs = config.audit_jobs.len(),
                targets = config.targets.len(),
                "Starting github-audit"
            );
            run(config).await?;
        }
    }

    Ok(())
}
