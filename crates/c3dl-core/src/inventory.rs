//! Local inventory scanning.
//!
//! The filesystem is the only source of truth for local state: every cycle
//! starts from a fresh [`scan`], nothing is cached between cycles.

use crate::config::CollectionConfig;
use crate::error::{Result, SyncError};
use crate::layout::CollectionLayout;
use crate::models::{FileState, LocalFile, MediaFormat, Source};
use crate::title::normalize_title;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const APPLEDOUBLE_PREFIX: &str = "._";

/// Index of a file inside an [`Inventory`].
pub type FileId = usize;

/// Complete files in one subset that share a normalized title and format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub subset: Source,
    pub normalized_title: String,
    pub format: MediaFormat,
    /// The copy to keep: longest file name, then newest modification time.
    pub keeper: FileId,
    /// Every other member, in path order.
    pub others: Vec<FileId>,
}

/// Snapshot of the local collection.
#[derive(Debug, Clone)]
pub struct Inventory {
    layout: CollectionLayout,
    files: Vec<LocalFile>,
    index: BTreeMap<(Source, String), Vec<FileId>>,
    duplicates: Vec<DuplicateGroup>,
    warnings: Vec<String>,
}

impl Inventory {
    /// Build an inventory from already classified files.
    ///
    /// Files are sorted by path so everything derived from the inventory is
    /// independent of directory enumeration order.
    pub fn from_files(layout: CollectionLayout, mut files: Vec<LocalFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut index: BTreeMap<(Source, String), Vec<FileId>> = BTreeMap::new();
        for (id, file) in files.iter().enumerate() {
            index
                .entry((file.subset, file.normalized_title.clone()))
                .or_default()
                .push(id);
        }

        let duplicates = find_duplicates(&files);

        Self {
            layout,
            files,
            index,
            duplicates,
            warnings: Vec::new(),
        }
    }

    fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn layout(&self) -> &CollectionLayout {
        &self.layout
    }

    pub fn files(&self) -> &[LocalFile] {
        &self.files
    }

    pub fn file(&self, id: FileId) -> &LocalFile {
        &self.files[id]
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Complete files of one subset.
    pub fn complete(&self, subset: Source) -> impl Iterator<Item = (FileId, &LocalFile)> {
        self.files
            .iter()
            .enumerate()
            .filter(move |(_, f)| f.subset == subset && f.state == FileState::Complete)
    }

    /// Interrupted downloads in either subset.
    pub fn partials(&self) -> impl Iterator<Item = (FileId, &LocalFile)> {
        self.files.iter().enumerate().filter(|(_, f)| f.is_partial())
    }

    /// All files (complete and partial) of a subset with this normalized title.
    pub fn by_title(&self, subset: Source, normalized_title: &str) -> impl Iterator<Item = &LocalFile> {
        self.index
            .get(&(subset, normalized_title.to_string()))
            .into_iter()
            .flatten()
            .map(|id| &self.files[*id])
    }

    pub fn duplicate_groups(&self) -> &[DuplicateGroup] {
        &self.duplicates
    }

    /// Entries that were skipped during the scan.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Enumerate the collection for one congress.
///
/// Read-only. Fails only if the collection root itself cannot be read; a
/// missing subset directory is an empty subset, and unreadable entries are
/// skipped and recorded as warnings.
pub fn scan(layout: &CollectionLayout) -> Result<Inventory> {
    let root = layout.root();
    std::fs::read_dir(root).map_err(|e| SyncError::Scan {
        path: root.to_path_buf(),
        message: e.to_string(),
        source: Some(e),
    })?;

    let mut files = Vec::new();
    let mut warnings = Vec::new();

    for subset in Source::ALL {
        let dir = layout.subset_dir(subset);
        if !dir.is_dir() {
            debug!("No {} directory at {}", subset, dir.display());
            continue;
        }

        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let message = format!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    warn!("{}", message);
                    warnings.push(message);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                let message = format!("Skipping non UTF-8 file name: {}", entry.path().display());
                warn!("{}", message);
                warnings.push(message);
                continue;
            };

            let Some((state, format)) = classify(name) else {
                debug!("Ignoring non-media file {}", entry.path().display());
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    let message = format!("Cannot stat {}: {}", entry.path().display(), e);
                    warn!("{}", message);
                    warnings.push(message);
                    continue;
                }
            };

            files.push(LocalFile {
                path: entry.path().to_path_buf(),
                subset,
                state,
                format,
                normalized_title: normalize_title(name),
                size_on_disk: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    let inventory = Inventory::from_files(layout.clone(), files).with_warnings(warnings);
    info!(
        "Scanned {}: {} file(s), {} partial, {} duplicate group(s)",
        layout.congress_dir().display(),
        inventory.len(),
        inventory.partials().count(),
        inventory.duplicate_groups().len()
    );
    Ok(inventory)
}

/// Classify a file purely by name. `None` for anything that is not media.
///
/// macOS AppleDouble companions (`._Talk.mp4`) are metadata, not media.
pub fn classify(file_name: &str) -> Option<(FileState, MediaFormat)> {
    if file_name.starts_with(APPLEDOUBLE_PREFIX) {
        return None;
    }
    let (state, base) = match file_name.strip_suffix(CollectionConfig::PART_SUFFIX) {
        Some(base) => (FileState::Partial, base),
        None => (FileState::Complete, file_name),
    };
    MediaFormat::from_file_name(base).map(|format| (state, format))
}

/// Keeper ordering: longer file name wins, then newer modification time.
/// The path breaks full ties so the choice never depends on input order.
fn keeper_order(a: &LocalFile, b: &LocalFile) -> Ordering {
    a.file_name()
        .chars()
        .count()
        .cmp(&b.file_name().chars().count())
        .then(a.modified.cmp(&b.modified))
        .then(a.path.cmp(&b.path))
}

fn find_duplicates(files: &[LocalFile]) -> Vec<DuplicateGroup> {
    let mut groups: BTreeMap<(Source, String, MediaFormat), Vec<FileId>> = BTreeMap::new();
    for (id, file) in files.iter().enumerate() {
        if file.state == FileState::Complete {
            groups
                .entry((file.subset, file.normalized_title.clone(), file.format))
                .or_default()
                .push(id);
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|((subset, normalized_title, format), members)| {
            let keeper = *members
                .iter()
                .max_by(|a, b| keeper_order(&files[**a], &files[**b]))?;
            let others = members.into_iter().filter(|id| *id != keeper).collect();
            Some(DuplicateGroup {
                subset,
                normalized_title,
                format,
                keeper,
                others,
            })
        })
        .collect()
}
