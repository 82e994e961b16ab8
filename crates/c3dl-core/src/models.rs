//! Core data types shared by the scanner, planner and executor.

use crate::config::CollectionConfig;
use crate::error::{Result, SyncError};
use crate::title::{normalize_title, sanitize_filename};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Which remote source an item comes from, and which local subset a file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Relive,
    Release,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Relive, Source::Release];

    /// Directory name of this subset below `<root>/<congress>/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Source::Relive => CollectionConfig::RELIVE_DIR_NAME,
            Source::Release => CollectionConfig::RELEASES_DIR_NAME,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Relive => write!(f, "relive"),
            Source::Release => write!(f, "release"),
        }
    }
}

/// Container format of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    Mp4,
    Webm,
    Mp3,
    Opus,
}

impl MediaFormat {
    pub const ALL: [MediaFormat; 4] = [
        MediaFormat::Mp4,
        MediaFormat::Webm,
        MediaFormat::Mp3,
        MediaFormat::Opus,
    ];

    /// File extension including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            MediaFormat::Mp4 => ".mp4",
            MediaFormat::Webm => ".webm",
            MediaFormat::Mp3 => ".mp3",
            MediaFormat::Opus => ".opus",
        }
    }

    /// Detect the format from a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        MediaFormat::ALL
            .into_iter()
            .find(|format| lower.ends_with(format.extension()))
    }
}

/// One entry from either remote source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Title as published.
    pub title: String,
    pub source: Source,
    pub url: String,
    /// Byte size advertised by the release feed.
    pub expected_size: Option<u64>,
    pub format: MediaFormat,
}

impl RemoteItem {
    /// A relive stream. Relives are always MP4 with no advertised size.
    pub fn relive(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source: Source::Relive,
            url: url.into(),
            expected_size: None,
            format: MediaFormat::Mp4,
        }
    }

    pub fn release(
        title: impl Into<String>,
        url: impl Into<String>,
        format: MediaFormat,
        expected_size: Option<u64>,
    ) -> Self {
        Self {
            title: title.into(),
            source: Source::Release,
            url: url.into(),
            // A zero length in a feed means "unknown", not an empty file.
            expected_size: expected_size.filter(|size| *size > 0),
            format,
        }
    }

    /// `source = Relive ⇒ format = Mp4`.
    pub fn is_consistent(&self) -> bool {
        self.source != Source::Relive || self.format == MediaFormat::Mp4
    }

    /// Reject items a catalog should never have produced.
    pub fn validate(&self) -> Result<()> {
        if !self.is_consistent() {
            return Err(SyncError::Config {
                message: format!("Relive item {:?} is not MP4", self.title),
            });
        }
        if self.url.trim().is_empty() {
            return Err(SyncError::Config {
                message: format!("Item {:?} has no URL", self.title),
            });
        }
        Ok(())
    }

    /// File name this item is stored under.
    pub fn file_name(&self) -> String {
        sanitize_filename(&self.title, self.format.extension())
    }

    /// Normalized key used to compare against local files.
    ///
    /// Derived from the stored file name rather than the raw title, so that
    /// truncation of very long titles is applied on both sides.
    pub fn match_key(&self) -> String {
        normalize_title(&self.file_name())
    }
}

/// Whether a local file is finished or an interrupted download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Complete,
    Partial,
}

/// One media file (or partial download) in the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub subset: Source,
    pub state: FileState,
    pub format: MediaFormat,
    pub normalized_title: String,
    pub size_on_disk: u64,
    pub modified: SystemTime,
}

impl LocalFile {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn is_partial(&self) -> bool {
        self.state == FileState::Partial
    }

    /// Path the file will have once complete (the path itself for complete files).
    pub fn final_path(&self) -> PathBuf {
        match self.state {
            FileState::Complete => self.path.clone(),
            FileState::Partial => strip_part_suffix(&self.path),
        }
    }
}

/// Path of the in-progress file for `destination`.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut os = destination.as_os_str().to_os_string();
    os.push(CollectionConfig::PART_SUFFIX);
    PathBuf::from(os)
}

fn strip_part_suffix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_suffix(CollectionConfig::PART_SUFFIX) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relive_items_are_mp4() {
        let item = RemoteItem::relive("Opening Ceremony", "https://cdn/relive/1/muxed.mp4");
        assert_eq!(item.format, MediaFormat::Mp4);
        assert!(item.is_consistent());

        let mut broken = item.clone();
        broken.format = MediaFormat::Opus;
        assert!(!broken.is_consistent());
        assert!(broken.validate().is_err());
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_release_zero_size_means_unknown() {
        let item = RemoteItem::release("Talk", "https://cdn/t.mp4", MediaFormat::Mp4, Some(0));
        assert_eq!(item.expected_size, None);
    }

    #[test]
    fn test_file_name_and_key() {
        let item = RemoteItem::release(
            "Hacking: The Next Level (39c3)",
            "https://cdn/t.webm",
            MediaFormat::Webm,
            Some(10),
        );
        assert_eq!(item.file_name(), "Hacking_ The Next Level (39c3).webm");
        assert_eq!(item.match_key(), "hacking the next level");
    }

    #[test]
    fn test_media_format_detection() {
        assert_eq!(MediaFormat::from_file_name("a.MP4"), Some(MediaFormat::Mp4));
        assert_eq!(MediaFormat::from_file_name("a.opus"), Some(MediaFormat::Opus));
        assert_eq!(MediaFormat::from_file_name("notes.txt"), None);
    }

    #[test]
    fn test_part_path_roundtrip() {
        let dest = PathBuf::from("/media/39c3/releases/Talk.mp4");
        let part = part_path(&dest);
        assert_eq!(part, PathBuf::from("/media/39c3/releases/Talk.mp4.part"));

        let file = LocalFile {
            path: part,
            subset: Source::Release,
            state: FileState::Partial,
            format: MediaFormat::Mp4,
            normalized_title: "talk".into(),
            size_on_disk: 1,
            modified: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(file.final_path(), dest);
        assert_eq!(file.file_name(), "Talk.mp4.part");
    }
}
