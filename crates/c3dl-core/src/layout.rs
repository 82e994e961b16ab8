//! Paths of one congress inside a collection root.
//!
//! ```text
//! <root>/.c3dl.lock
//! <root>/<congress>/relive/*
//! <root>/<congress>/releases/*
//! ```

use crate::config::CollectionConfig;
use crate::error::{Result, SyncError};
use crate::models::Source;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionLayout {
    root: PathBuf,
    congress: String,
}

impl CollectionLayout {
    /// Congress identifiers are case-insensitive ("39C3" and "39c3" share a directory).
    pub fn new(root: impl Into<PathBuf>, congress: &str) -> Self {
        Self {
            root: root.into(),
            congress: congress.trim().to_lowercase(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn congress(&self) -> &str {
        &self.congress
    }

    pub fn congress_dir(&self) -> PathBuf {
        self.root.join(&self.congress)
    }

    pub fn subset_dir(&self, subset: Source) -> PathBuf {
        self.congress_dir().join(subset.dir_name())
    }

    pub fn relive_dir(&self) -> PathBuf {
        self.subset_dir(Source::Relive)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.subset_dir(Source::Release)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(CollectionConfig::LOCK_FILE_NAME)
    }

    /// Reject congress identifiers that would escape the collection root.
    pub fn validate(&self) -> Result<()> {
        let valid = !self.congress.is_empty()
            && self
                .congress
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(SyncError::Config {
                message: format!("Invalid congress identifier: {:?}", self.congress),
            })
        }
    }

    /// Create both subset directories if they don't exist.
    pub fn ensure_directories(&self) -> Result<()> {
        for subset in Source::ALL {
            let dir = self.subset_dir(subset);
            std::fs::create_dir_all(&dir).map_err(|e| SyncError::io_with_path(e, &dir))?;
        }
        Ok(())
    }
}
