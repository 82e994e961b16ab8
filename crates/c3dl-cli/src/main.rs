//! c3dl - keeps a local collection of CCC congress recordings up to date.
//!
//! Runs one reconciliation cycle against item lists that an external fetcher
//! has written as JSON, then exits. Rerun it from a scheduler to keep the
//! collection current.

mod catalog;

use anyhow::{Context, Result};
use c3dl_core::{
    clean_partial, collection_stats, format_size, Engine, HttpSource, Quality, SyncConfig,
    TransferProgress,
};
use catalog::JsonCatalog;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "c3dl")]
#[command(about = "Download and tidy CCC congress recordings")]
struct Args {
    /// Congress identifier, e.g. 39c3
    congress: String,

    /// Collection root directory
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Release quality preset (hd, sd, webm, webm-sd, mp3, opus)
    #[arg(short, long)]
    quality: Option<Quality>,

    /// Extra attempts per download after the first
    #[arg(long)]
    retries: Option<u32>,

    /// Number of downloads to run at once
    #[arg(short, long)]
    parallel: Option<usize>,

    /// JSON file with the release feed items
    #[arg(long)]
    releases_json: Option<PathBuf>,

    /// JSON file with the relive listing items
    #[arg(long)]
    relive_json: Option<PathBuf>,

    /// Randomize retry delays
    #[arg(long)]
    jitter: bool,

    /// Base configuration file (JSON); flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Never delete duplicates, superseded relives or orphaned partials
    #[arg(long)]
    no_cleanup: bool,

    /// Ignore the relive subset
    #[arg(long)]
    no_relive: bool,

    /// Ignore the release subset
    #[arg(long)]
    no_releases: bool,

    /// Print the plan without executing it
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Delete all partial downloads and exit
    #[arg(long, conflicts_with_all = ["stats", "dry_run"])]
    clean_partial: bool,

    /// Show collection statistics and exit
    #[arg(long)]
    stats: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn sync_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => SyncConfig::default(),
        };

        if let Some(quality) = self.quality {
            config = config.with_quality(quality);
        }
        if let Some(retries) = self.retries {
            config = config.with_retries(retries);
        }
        if let Some(parallel) = self.parallel {
            config = config.with_max_parallel(parallel);
        }
        if self.jitter {
            config = config.with_retry_jitter(true);
        }
        if self.no_cleanup {
            config = config.with_cleanup(false);
        }
        if self.no_relive {
            config = config.with_relive(false);
        }
        if self.no_releases {
            config = config.with_releases(false);
        }
        if self.dry_run {
            config = config.with_dry_run(true);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // RUST_LOG wins over --debug when set
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if args.stats {
        let stats = collection_stats(&args.root, &args.congress)?;
        println!("{}", stats);
        return Ok(ExitCode::SUCCESS);
    }

    if args.clean_partial {
        let removed = clean_partial(&args.root, &args.congress).await?;
        println!("Removed {} partial download(s)", removed);
        return Ok(ExitCode::SUCCESS);
    }

    let config = args.sync_config()?;
    info!(
        "Syncing {} into {} ({})",
        args.congress,
        args.root.display(),
        config.quality.description()
    );

    let (progress_tx, progress_rx) = mpsc::channel(64);
    let catalog = JsonCatalog::new(args.releases_json.clone(), args.relive_json.clone());
    let engine = Engine::new(Arc::new(catalog), Arc::new(HttpSource::new()?))
        .with_progress(progress_tx);

    let cancel = engine.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after current writes");
            cancel.cancel();
        }
    });
    let progress_task = tokio::spawn(log_progress(progress_rx));

    let report = engine.run_cycle(&args.root, &args.congress, &config).await?;
    drop(engine);
    join_progress(progress_task).await;

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    if report.dry_run {
        for outcome in &report.outcomes {
            println!("{:<8} {} ({})", outcome.kind, outcome.subject, outcome.reason);
        }
    }
    println!("{}", report.summary());

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Wait for the progress reporter; returns false if it panicked or was aborted.
async fn join_progress(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Progress reporter stopped abnormally: {}", e);
            false
        }
    }
}

async fn log_progress(mut progress_rx: mpsc::Receiver<TransferProgress>) {
    while let Some(progress) = progress_rx.recv().await {
        match progress.percent {
            Some(percent) => info!(
                "{}: {:.1}% of {} at {}/s",
                progress.title,
                percent,
                format_size(progress.total_bytes.unwrap_or_default()),
                format_size(progress.speed_bytes_per_sec as u64)
            ),
            None => debug!(
                "{}: {} at {}/s",
                progress.title,
                format_size(progress.bytes_transferred),
                format_size(progress.speed_bytes_per_sec as u64)
            ),
        }
    }
}
