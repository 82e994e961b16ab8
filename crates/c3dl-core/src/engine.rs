//! One reconciliation cycle, end to end.
//!
//! lock → scan → fetch → plan → execute → report. The lock guard lives for
//! the whole cycle and is released when [`Engine::run_cycle`] returns.

use crate::cancel::CancellationToken;
use crate::config::{Quality, SyncConfig};
use crate::error::{FetchError, Result, TransferError};
use crate::inventory::scan;
use crate::layout::CollectionLayout;
use crate::lock::InstanceLock;
use crate::models::{RemoteItem, Source};
use crate::planner::{self, Action, ActionKind, DownloadJob, Operation, Plan, RemoteLists};
use crate::transfer::{apply_local, ByteSource, TransferExecutor, TransferProgress};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The two remote sources, already parsed into items.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Release feed for `congress` in the given quality.
    async fn fetch_release_items(
        &self,
        congress: &str,
        quality: Quality,
    ) -> std::result::Result<Vec<RemoteItem>, FetchError>;

    /// Relive listing for `congress`.
    async fn fetch_relive_items(
        &self,
        congress: &str,
    ) -> std::result::Result<Vec<RemoteItem>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Not executed because the cycle was cancelled.
    Cancelled,
    /// Dry run: would have been executed.
    Planned,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeStatus::Succeeded => "ok",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Cancelled => "cancelled",
            OutcomeStatus::Planned => "planned",
        };
        f.write_str(s)
    }
}

/// Terminal state of one planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    pub subject: String,
    pub reason: String,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    /// Bytes fetched for downloads.
    pub bytes: u64,
}

impl ActionOutcome {
    fn new(action: &Action, status: OutcomeStatus) -> Self {
        Self {
            kind: action.kind(),
            subject: action.subject(),
            reason: action.reason.clone(),
            status,
            error: None,
            bytes: 0,
        }
    }

    fn failed(action: &Action, error: &TransferError) -> Self {
        let status = match error {
            TransferError::Cancelled => OutcomeStatus::Cancelled,
            _ => OutcomeStatus::Failed,
        };
        let bytes = match error {
            TransferError::Failed { fetched, .. } => *fetched,
            _ => 0,
        };
        Self {
            error: Some(error.to_string()),
            bytes,
            ..Self::new(action, status)
        }
    }
}

/// Everything that happened in one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub congress: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub dry_run: bool,
    /// Number of actions in the plan, skips included.
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub bytes_transferred: u64,
    /// One entry per planned action, in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// Unavailable sources and unreadable entries.
    pub warnings: Vec<String>,
}

impl CycleReport {
    fn new(congress: &str, started_at: DateTime<Local>, dry_run: bool, planned: usize) -> Self {
        Self {
            congress: congress.to_string(),
            started_at,
            finished_at: started_at,
            dry_run,
            planned,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            bytes_transferred: 0,
            outcomes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn tally(&mut self) {
        let count = |status| self.outcomes.iter().filter(|o| o.status == status).count();
        self.succeeded = count(OutcomeStatus::Succeeded);
        self.failed = count(OutcomeStatus::Failed);
        self.skipped = count(OutcomeStatus::Skipped);
        self.cancelled = count(OutcomeStatus::Cancelled);
        self.bytes_transferred = self.outcomes.iter().map(|o| o.bytes).sum();
    }

    /// True when no action failed and nothing was cancelled.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} planned, {} succeeded, {} failed, {} skipped, {} cancelled, {} transferred",
            self.congress,
            self.planned,
            self.succeeded,
            self.failed,
            self.skipped,
            self.cancelled,
            format_size(self.bytes_transferred)
        )
    }
}

/// Drives reconciliation cycles against a catalog and a byte source.
pub struct Engine {
    catalog: Arc<dyn RemoteCatalog>,
    source: Arc<dyn ByteSource>,
    cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
}

impl Engine {
    pub fn new(catalog: Arc<dyn RemoteCatalog>, source: Arc<dyn ByteSource>) -> Self {
        Self {
            catalog,
            source,
            cancel: CancellationToken::new(),
            progress_tx: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress_tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one cycle for `congress` below `root`.
    ///
    /// Fails before touching anything if the configuration is invalid, the
    /// lock is held elsewhere, or the root cannot be scanned. Individual
    /// action failures are reported in the [`CycleReport`], never returned.
    pub async fn run_cycle(
        &self,
        root: &Path,
        congress: &str,
        config: &SyncConfig,
    ) -> Result<CycleReport> {
        let started_at = Local::now();
        config.validate()?;
        let layout = CollectionLayout::new(root, congress);
        layout.validate()?;

        let _lock = InstanceLock::acquire(root)?;
        if !config.dry_run {
            layout.ensure_directories()?;
        }

        let inventory = scan(&layout)?;
        let mut warnings = inventory.warnings().to_vec();
        let remote = self.fetch_remote(&layout, config, &mut warnings).await;
        let plan = planner::plan(&remote, &inventory, config);

        let mut report = CycleReport::new(layout.congress(), started_at, config.dry_run, plan.len());
        report.warnings = warnings;
        report.outcomes = if config.dry_run {
            dry_run_outcomes(&plan)
        } else {
            self.execute(&plan, config).await
        };
        report.tally();
        report.finished_at = Local::now();

        for outcome in &report.outcomes {
            log_outcome(outcome);
        }
        info!("Cycle finished for {}", report.summary());
        Ok(report)
    }

    async fn fetch_remote(
        &self,
        layout: &CollectionLayout,
        config: &SyncConfig,
        warnings: &mut Vec<String>,
    ) -> RemoteLists {
        let releases = if config.releases {
            let fetched = self
                .catalog
                .fetch_release_items(layout.congress(), config.quality)
                .await;
            accept_items(Source::Release, fetched, warnings)
        } else {
            None
        };

        let relive = if config.relive {
            let fetched = self.catalog.fetch_relive_items(layout.congress()).await;
            accept_items(Source::Relive, fetched, warnings)
        } else {
            None
        };

        RemoteLists::new(releases, relive)
    }

    /// Local operations first, in plan order; then downloads with bounded parallelism.
    async fn execute(&self, plan: &Plan, config: &SyncConfig) -> Vec<ActionOutcome> {
        let actions = plan.actions();
        let mut outcomes: Vec<Option<ActionOutcome>> = vec![None; actions.len()];
        let mut downloads: Vec<(usize, &DownloadJob)> = Vec::new();

        for (index, action) in actions.iter().enumerate() {
            let outcome = match &action.operation {
                Operation::Skip { .. } => ActionOutcome::new(action, OutcomeStatus::Skipped),
                Operation::Download(job) => {
                    downloads.push((index, job));
                    continue;
                }
                Operation::Rename { .. } | Operation::Delete { .. } => {
                    if self.cancel.is_cancelled() {
                        ActionOutcome::new(action, OutcomeStatus::Cancelled)
                    } else {
                        match apply_local(&action.operation).await {
                            Ok(()) => ActionOutcome::new(action, OutcomeStatus::Succeeded),
                            Err(e) => ActionOutcome::failed(action, &e),
                        }
                    }
                }
            };
            outcomes[index] = Some(outcome);
        }

        let mut executor = TransferExecutor::new(self.source.clone(), self.cancel.clone())
            .with_backoff(config.retry_base_delay, config.retry_max_delay)
            .with_jitter(config.retry_jitter);
        if let Some(ref tx) = self.progress_tx {
            executor = executor.with_progress(tx.clone());
        }
        let executor = &executor;

        let results: Vec<(usize, std::result::Result<u64, TransferError>)> =
            futures::stream::iter(downloads)
                .map(|(index, job)| async move { (index, executor.execute(job, config.retries).await) })
                .buffer_unordered(config.max_parallel.max(1))
                .collect()
                .await;

        for (index, result) in results {
            let action = &actions[index];
            outcomes[index] = Some(match result {
                Ok(bytes) => ActionOutcome {
                    bytes,
                    ..ActionOutcome::new(action, OutcomeStatus::Succeeded)
                },
                Err(e) => ActionOutcome::failed(action, &e),
            });
        }

        outcomes.into_iter().flatten().collect()
    }
}

fn accept_items(
    source: Source,
    fetched: std::result::Result<Vec<RemoteItem>, FetchError>,
    warnings: &mut Vec<String>,
) -> Option<Vec<RemoteItem>> {
    match fetched {
        Ok(items) => {
            let total = items.len();
            let valid: Vec<RemoteItem> = items
                .into_iter()
                .filter(|item| match item.validate() {
                    Ok(()) if item.source == source => true,
                    Ok(()) => {
                        warn!("Dropping {:?}: listed as {} in the {} catalog", item.title, item.source, source);
                        false
                    }
                    Err(e) => {
                        warn!("Dropping invalid {} item: {}", source, e);
                        false
                    }
                })
                .collect();
            info!("Fetched {} {} item(s) ({} usable)", total, source, valid.len());
            Some(valid)
        }
        Err(e) => {
            warn!("{} source unavailable this cycle: {}", source, e);
            warnings.push(e.to_string());
            None
        }
    }
}

fn dry_run_outcomes(plan: &Plan) -> Vec<ActionOutcome> {
    plan.actions()
        .iter()
        .map(|action| {
            let status = match action.kind() {
                ActionKind::Skip => OutcomeStatus::Skipped,
                _ => OutcomeStatus::Planned,
            };
            ActionOutcome::new(action, status)
        })
        .collect()
}

fn log_outcome(outcome: &ActionOutcome) {
    match outcome.status {
        OutcomeStatus::Failed => warn!(
            "[{}] {} {}: {} ({})",
            outcome.status,
            outcome.kind,
            outcome.subject,
            outcome.error.as_deref().unwrap_or("unknown error"),
            outcome.reason
        ),
        _ => info!(
            "[{}] {} {}: {}",
            outcome.status, outcome.kind, outcome.subject, outcome.reason
        ),
    }
}

/// Delete every partial download of `congress`, bypassing the planner.
///
/// Takes the instance lock. Returns the number of files removed.
pub async fn clean_partial(root: &Path, congress: &str) -> Result<usize> {
    let layout = CollectionLayout::new(root, congress);
    layout.validate()?;
    let _lock = InstanceLock::acquire(root)?;

    let inventory = scan(&layout)?;
    let mut removed = 0;
    for (_, partial) in inventory.partials() {
        match tokio::fs::remove_file(&partial.path).await {
            Ok(()) => {
                info!("Removed {}", partial.path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", partial.path.display(), e),
        }
    }
    info!("Removed {} partial download(s)", removed);
    Ok(removed)
}

/// File count and size of one subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsetStats {
    pub subset: Source,
    pub files: usize,
    pub bytes: u64,
}

/// Overview of a local collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub congress: String,
    pub subsets: Vec<SubsetStats>,
    pub partials: usize,
    pub partial_bytes: u64,
    pub duplicate_groups: usize,
}

impl CollectionStats {
    pub fn total_files(&self) -> usize {
        self.subsets.iter().map(|s| s.files).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.subsets.iter().map(|s| s.bytes).sum()
    }
}

impl std::fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Collection {}", self.congress)?;
        for subset in &self.subsets {
            writeln!(
                f,
                "  {:<8} {:>5} file(s)  {}",
                subset.subset.dir_name(),
                subset.files,
                format_size(subset.bytes)
            )?;
        }
        writeln!(
            f,
            "  {:<8} {:>5} file(s)  {}",
            "partial",
            self.partials,
            format_size(self.partial_bytes)
        )?;
        write!(
            f,
            "  total    {:>5} file(s)  {}",
            self.total_files(),
            format_size(self.total_bytes())
        )
    }
}

/// Read-only statistics for `congress` below `root`. Does not take the lock.
pub fn collection_stats(root: &Path, congress: &str) -> Result<CollectionStats> {
    let layout = CollectionLayout::new(root, congress);
    layout.validate()?;
    let inventory = scan(&layout)?;

    let subsets = Source::ALL
        .into_iter()
        .map(|subset| {
            let (files, bytes) = inventory
                .complete(subset)
                .fold((0, 0), |(n, b), (_, f)| (n + 1, b + f.size_on_disk));
            SubsetStats {
                subset,
                files,
                bytes,
            }
        })
        .collect();

    let (partials, partial_bytes) = inventory
        .partials()
        .fold((0, 0), |(n, b), (_, f)| (n + 1, b + f.size_on_disk));

    Ok(CollectionStats {
        congress: layout.congress().to_string(),
        subsets,
        partials,
        partial_bytes,
        duplicate_groups: inventory.duplicate_groups().len(),
    })
}

/// Format bytes as a human-readable string.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
