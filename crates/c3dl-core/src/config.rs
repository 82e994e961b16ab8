//! Centralized configuration for c3dl.
//!
//! Constant holders (`NetworkConfig`, `CollectionConfig`) carry values that
//! never change at runtime. [`SyncConfig`] is the per-cycle configuration the
//! caller assembles; [`MatchConfig`] holds the tunable title-matching knobs.

use crate::error::{Result, SyncError};
use crate::models::MediaFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = concat!("c3dl/", env!("CARGO_PKG_VERSION"));
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Maximum silence on an open transfer before it counts as a transient failure.
    pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_RETRIES: u32 = 3;
    /// First backoff delay; doubles per attempt (5s, 10s, 20s, ...).
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(120);
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_PARALLEL_TRANSFERS: usize = 1;
}

/// On-disk collection layout.
pub struct CollectionConfig;

impl CollectionConfig {
    /// Reserved suffix marking an in-progress download.
    pub const PART_SUFFIX: &'static str = ".part";
    pub const RELIVE_DIR_NAME: &'static str = "relive";
    pub const RELEASES_DIR_NAME: &'static str = "releases";
    pub const LOCK_FILE_NAME: &'static str = ".c3dl.lock";
    /// Byte budget for a generated file name, extension included.
    pub const MAX_FILENAME_BYTES: usize = 240;
}

/// Title matching knobs.
///
/// The defaults were calibrated against congress schedules where relive and
/// release titles differ by subtitles, colons and trailing edit notes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Minimum similarity score (0.0 to 1.0) for two titles to be the same talk.
    pub threshold: f64,
    /// Minimum token count of the shorter title before token containment counts
    /// as a full match.
    pub min_containment_tokens: usize,
}

impl MatchConfig {
    pub const DEFAULT_THRESHOLD: f64 = 0.85;
    pub const DEFAULT_MIN_CONTAINMENT_TOKENS: usize = 3;
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
            min_containment_tokens: Self::DEFAULT_MIN_CONTAINMENT_TOKENS,
        }
    }
}

/// Release quality preset. Relive streams ignore it (always MP4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    #[default]
    Hd,
    Sd,
    Webm,
    WebmSd,
    Mp3,
    Opus,
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Quality::Hd,
        Quality::Sd,
        Quality::Webm,
        Quality::WebmSd,
        Quality::Mp3,
        Quality::Opus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Hd => "hd",
            Quality::Sd => "sd",
            Quality::Webm => "webm",
            Quality::WebmSd => "webm-sd",
            Quality::Mp3 => "mp3",
            Quality::Opus => "opus",
        }
    }

    /// Name of the release podcast feed serving this quality.
    pub fn feed_name(&self) -> &'static str {
        match self {
            Quality::Hd => "mp4-hq",
            Quality::Sd => "mp4",
            Quality::Webm => "webm-hq",
            Quality::WebmSd => "webm",
            Quality::Mp3 => "mp3",
            Quality::Opus => "opus",
        }
    }

    pub fn format(&self) -> MediaFormat {
        match self {
            Quality::Hd | Quality::Sd => MediaFormat::Mp4,
            Quality::Webm | Quality::WebmSd => MediaFormat::Webm,
            Quality::Mp3 => MediaFormat::Mp3,
            Quality::Opus => MediaFormat::Opus,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Quality::Hd => "1080p MP4",
            Quality::Sd => "576p MP4",
            Quality::Webm => "1080p WebM",
            Quality::WebmSd => "576p WebM",
            Quality::Mp3 => "MP3 audio",
            Quality::Opus => "Opus audio",
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_lowercase();
        Quality::ALL
            .into_iter()
            .find(|q| q.as_str() == wanted)
            .ok_or_else(|| SyncError::Config {
                message: format!("Unknown quality preset: {}", s),
            })
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-cycle engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Release quality preset.
    pub quality: Quality,
    /// Extra attempts after the first failed one.
    pub retries: u32,
    /// Delete duplicates, superseded relives and orphaned partials.
    pub cleanup: bool,
    /// Reconcile relive streams.
    pub relive: bool,
    /// Reconcile releases.
    pub releases: bool,
    /// Plan and report, but execute nothing.
    pub dry_run: bool,
    /// Maximum concurrent downloads.
    pub max_parallel: usize,
    pub matching: MatchConfig,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Scale each backoff delay randomly by 0.5x to 1.5x.
    pub retry_jitter: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            retries: NetworkConfig::DEFAULT_RETRIES,
            cleanup: true,
            relive: true,
            releases: true,
            dry_run: false,
            max_parallel: NetworkConfig::DEFAULT_PARALLEL_TRANSFERS,
            matching: MatchConfig::default(),
            retry_base_delay: NetworkConfig::RETRY_BASE_DELAY,
            retry_max_delay: NetworkConfig::RETRY_MAX_DELAY,
            retry_jitter: false,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_relive(mut self, relive: bool) -> Self {
        self.relive = relive;
        self
    }

    pub fn with_releases(mut self, releases: bool) -> Self {
        self.releases = releases;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.matching.threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: bool) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Reject configurations the planner or executor cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !self.relive && !self.releases {
            return Err(SyncError::Config {
                message: "Both relive and releases are disabled; nothing to do".into(),
            });
        }
        if self.max_parallel == 0 {
            return Err(SyncError::Config {
                message: "max_parallel must be at least 1".into(),
            });
        }
        if !(self.matching.threshold > 0.0 && self.matching.threshold <= 1.0) {
            return Err(SyncError::Config {
                message: format!(
                    "Match threshold must be in (0, 1], got {}",
                    self.matching.threshold
                ),
            });
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(SyncError::Config {
                message: "retry_base_delay exceeds retry_max_delay".into(),
            });
        }
        Ok(())
    }
}
