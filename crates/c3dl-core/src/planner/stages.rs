//! The five planning stages.
//!
//! Each stage consumes the view produced by the previous one, so the order
//! (duplicates, supersession, releases, relives, partials) cannot be changed
//! by accident.

use super::{DownloadJob, PlanBuilder, RemoteLists};
use crate::config::SyncConfig;
use crate::inventory::{FileId, Inventory};
use crate::matcher::{best_match, is_match};
use crate::models::{LocalFile, RemoteItem, Source};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

/// Inventory with non-keeper duplicates removed.
pub(crate) struct DedupedView<'a> {
    inventory: &'a Inventory,
    removed: BTreeSet<FileId>,
}

/// Inventory with duplicates and superseded relives removed.
///
/// Release and relive reconciliation both read from this view.
pub(crate) struct ReconcileView<'a> {
    inventory: &'a Inventory,
    removed: BTreeSet<FileId>,
}

impl ReconcileView<'_> {
    fn complete(&self, subset: Source) -> impl Iterator<Item = (FileId, &LocalFile)> {
        self.inventory
            .complete(subset)
            .filter(|(id, _)| !self.removed.contains(id))
    }
}

/// Stage 1: delete every non-keeper of each duplicate group.
pub(crate) fn resolve_duplicates<'a>(
    inventory: &'a Inventory,
    config: &SyncConfig,
    builder: &mut PlanBuilder,
) -> DedupedView<'a> {
    let mut removed = BTreeSet::new();
    if !config.cleanup {
        return DedupedView { inventory, removed };
    }

    for group in inventory.duplicate_groups() {
        let keeper = inventory.file(group.keeper);
        let keeper_len = keeper.file_name().chars().count();
        for id in &group.others {
            let other = inventory.file(*id);
            let reason = if other.file_name().chars().count() < keeper_len {
                "duplicate, shorter filename"
            } else {
                "duplicate, older copy"
            };
            builder.delete(&other.path, reason);
            removed.insert(*id);
        }
        builder.skip(keeper.file_name(), "duplicate keeper");
    }

    DedupedView { inventory, removed }
}

/// Stage 2: delete local relive files that a release now covers.
pub(crate) fn supersede_relives<'a>(
    view: DedupedView<'a>,
    releases: Option<&[RemoteItem]>,
    config: &SyncConfig,
    builder: &mut PlanBuilder,
) -> ReconcileView<'a> {
    let DedupedView {
        inventory,
        mut removed,
    } = view;

    if let (true, Some(releases)) = (config.cleanup, releases) {
        let release_keys: Vec<(String, &str)> = releases
            .iter()
            .map(|item| (item.match_key(), item.title.as_str()))
            .collect();

        for (id, file) in inventory.complete(Source::Relive) {
            if removed.contains(&id) {
                continue;
            }
            let covering = release_keys
                .iter()
                .find(|(key, _)| is_match(&file.normalized_title, key, &config.matching));
            if let Some((_, title)) = covering {
                debug!("{} superseded by release {:?}", file.file_name(), title);
                builder.delete(&file.path, format!("superseded by release \"{}\"", title));
                removed.insert(id);
            }
        }
    }

    ReconcileView { inventory, removed }
}

/// Stage 3: bring the release subset in line with the release feed.
pub(crate) fn reconcile_releases(
    view: &ReconcileView<'_>,
    releases: &[RemoteItem],
    config: &SyncConfig,
    builder: &mut PlanBuilder,
) {
    let format = config.quality.format();
    let releases_dir = view.inventory.layout().releases_dir();

    let items: Vec<&RemoteItem> = releases
        .iter()
        .filter(|item| {
            if item.format != format {
                debug!("Ignoring {} ({:?}): not the configured quality", item.title, item.format);
                return false;
            }
            true
        })
        .collect();
    let keys: Vec<String> = items.iter().map(|item| item.match_key()).collect();

    let candidates: Vec<(FileId, &LocalFile)> = view
        .complete(Source::Release)
        .filter(|(_, file)| file.format == format)
        .collect();

    // Exact passes over all items first, so a fuzzy match can never steal a
    // file that another item names exactly. Files already sitting at an
    // item's own destination are claimed before any same-key fallback.
    let destinations: Vec<PathBuf> = items
        .iter()
        .map(|item| releases_dir.join(item.file_name()))
        .collect();
    let mut claimed: BTreeSet<FileId> = BTreeSet::new();
    let mut matches: Vec<Option<FileId>> = vec![None; items.len()];
    for (index, destination) in destinations.iter().enumerate() {
        let in_place = candidates
            .iter()
            .find(|(id, file)| !claimed.contains(id) && file.path == *destination);
        if let Some((id, file)) = in_place {
            if file.normalized_title == keys[index] {
                claimed.insert(*id);
                matches[index] = Some(*id);
            }
        }
    }
    for (index, key) in keys.iter().enumerate() {
        if matches[index].is_some() {
            continue;
        }
        let same_key = candidates
            .iter()
            .find(|(id, file)| !claimed.contains(id) && file.normalized_title == *key);
        if let Some((id, _)) = same_key {
            claimed.insert(*id);
            matches[index] = Some(*id);
        }
    }

    for (index, key) in keys.iter().enumerate() {
        if matches[index].is_some() {
            continue;
        }
        let unclaimed = candidates
            .iter()
            .filter(|(id, _)| !claimed.contains(id))
            .map(|(id, file)| (file.normalized_title.as_str(), *id));
        if let Some((id, score)) = best_match(key, unclaimed, &config.matching) {
            debug!(
                "Fuzzy match {:?} -> {} (score {:.3})",
                items[index].title,
                view.inventory.file(id).file_name(),
                score
            );
            claimed.insert(id);
            matches[index] = Some(id);
        }
    }

    for ((item, matched), destination) in items.into_iter().zip(matches).zip(destinations) {
        if builder.is_written(&destination) {
            builder.skip(&item.title, "duplicate destination");
            continue;
        }

        let Some(id) = matched else {
            builder.download(DownloadJob::new(item.clone(), destination), "new release");
            continue;
        };
        let local = view.inventory.file(id);

        match item.expected_size {
            Some(expected) if expected != local.size_on_disk => {
                let reason = format!(
                    "size mismatch: {} bytes on disk, {} expected",
                    local.size_on_disk, expected
                );
                if local.path != destination && config.cleanup {
                    builder.delete(&local.path, format!("corrupt copy, replaced by \"{}\"", item.file_name()));
                }
                builder.download(DownloadJob::new(item.clone(), destination), reason);
            }
            _ if local.path != destination => {
                builder.rename(&local.path, &destination, "title changed");
            }
            _ => builder.skip(&item.title, "already downloaded"),
        }
    }
}

/// Stage 4: relive streams for talks without a release.
pub(crate) fn reconcile_relives(
    view: &ReconcileView<'_>,
    relive: &[RemoteItem],
    releases: Option<&[RemoteItem]>,
    config: &SyncConfig,
    builder: &mut PlanBuilder,
) {
    if !config.relive {
        return;
    }
    let relive_dir = view.inventory.layout().relive_dir();
    let release_keys: Vec<String> = releases
        .unwrap_or_default()
        .iter()
        .map(|item| item.match_key())
        .collect();

    let local_relives: Vec<&LocalFile> = view.complete(Source::Relive).map(|(_, f)| f).collect();
    let local_releases: Vec<&LocalFile> = view.complete(Source::Release).map(|(_, f)| f).collect();

    for item in relive {
        let key = item.match_key();

        if release_keys
            .iter()
            .any(|release| is_match(&key, release, &config.matching))
        {
            builder.skip(&item.title, "superseded by release");
            continue;
        }
        if found_locally(&key, &local_relives, config) {
            builder.skip(&item.title, "already downloaded");
            continue;
        }
        if found_locally(&key, &local_releases, config) {
            builder.skip(&item.title, "already have it via release");
            continue;
        }

        let destination = relive_dir.join(item.file_name());
        if builder.is_written(&destination) {
            builder.skip(&item.title, "duplicate destination");
            continue;
        }
        builder.download(DownloadJob::new(item.clone(), destination), "new relive");
    }
}

fn found_locally(key: &str, files: &[&LocalFile], config: &SyncConfig) -> bool {
    files.iter().any(|f| f.normalized_title == key)
        || best_match(
            key,
            files.iter().map(|f| (f.normalized_title.as_str(), ())),
            &config.matching,
        )
        .is_some()
}

/// Stage 5: resume partials that a download will finish, clean up the rest.
pub(crate) fn handle_partials(
    view: &ReconcileView<'_>,
    remote: &RemoteLists,
    config: &SyncConfig,
    builder: &mut PlanBuilder,
) {
    for (_, partial) in view.inventory.partials() {
        let final_path = partial.final_path();
        if builder.attach_resume(&final_path, partial) {
            debug!(
                "Resuming {} at {} bytes",
                partial.file_name(),
                partial.size_on_disk
            );
            continue;
        }

        let source_known = match partial.subset {
            Source::Release => remote.releases.is_some(),
            Source::Relive => remote.relive.is_some(),
        };
        if config.cleanup && source_known && !builder.is_pending_delete(&partial.path) {
            builder.delete(&partial.path, "orphaned partial download");
        }
    }
}
