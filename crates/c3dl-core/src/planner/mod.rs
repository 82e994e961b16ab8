//! Reconciliation planning.
//!
//! [`plan`] turns the remote item lists and a local [`Inventory`] into an
//! ordered list of [`Action`]s. Planning is pure: it never touches the
//! filesystem or the network, so running it twice on the same inputs yields
//! the same plan.

mod stages;

use crate::config::SyncConfig;
use crate::inventory::Inventory;
use crate::models::{part_path, LocalFile, RemoteItem};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Remote item lists for one cycle.
///
/// `None` means the source is disabled or its fetch failed. Stages for that
/// source are skipped and its partial downloads are left alone.
#[derive(Debug, Clone, Default)]
pub struct RemoteLists {
    pub releases: Option<Vec<RemoteItem>>,
    pub relive: Option<Vec<RemoteItem>>,
}

impl RemoteLists {
    pub fn new(releases: Option<Vec<RemoteItem>>, relive: Option<Vec<RemoteItem>>) -> Self {
        Self { releases, relive }
    }
}

/// A download the executor should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub item: RemoteItem,
    pub destination: PathBuf,
    /// Partial file left by an earlier cycle, if any.
    pub resume: Option<LocalFile>,
}

impl DownloadJob {
    pub fn new(item: RemoteItem, destination: PathBuf) -> Self {
        Self {
            item,
            destination,
            resume: None,
        }
    }

    pub fn partial_path(&self) -> PathBuf {
        part_path(&self.destination)
    }

    /// Bytes already on disk from an earlier attempt.
    pub fn resume_offset(&self) -> u64 {
        self.resume.as_ref().map(|f| f.size_on_disk).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Download(DownloadJob),
    Rename { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
    Skip { subject: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Download,
    Rename,
    Delete,
    Skip,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Download => "download",
            ActionKind::Rename => "rename",
            ActionKind::Delete => "delete",
            ActionKind::Skip => "skip",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned step with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub operation: Operation,
    pub reason: String,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self.operation {
            Operation::Download(_) => ActionKind::Download,
            Operation::Rename { .. } => ActionKind::Rename,
            Operation::Delete { .. } => ActionKind::Delete,
            Operation::Skip { .. } => ActionKind::Skip,
        }
    }

    /// What the action is about, for logs and reports.
    pub fn subject(&self) -> String {
        match &self.operation {
            Operation::Download(job) => job.item.title.clone(),
            Operation::Rename { from, to } => format!("{} -> {}", file_label(from), file_label(to)),
            Operation::Delete { path } => file_label(path),
            Operation::Skip { subject } => subject.clone(),
        }
    }

    /// Every path this action writes, moves or removes.
    pub fn touched_paths(&self) -> Vec<&Path> {
        match &self.operation {
            Operation::Download(job) => vec![job.destination.as_path()],
            Operation::Rename { from, to } => vec![from.as_path(), to.as_path()],
            Operation::Delete { path } => vec![path.as_path()],
            Operation::Skip { .. } => Vec::new(),
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Ordered actions for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    actions: Vec<Action>,
}

impl Plan {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }

    /// True when nothing is left to do: local state matches remote state.
    pub fn is_converged(&self) -> bool {
        self.actions.iter().all(|a| a.kind() == ActionKind::Skip)
    }

    pub fn downloads(&self) -> impl Iterator<Item = &DownloadJob> {
        self.actions.iter().filter_map(|a| match &a.operation {
            Operation::Download(job) => Some(job),
            _ => None,
        })
    }
}

/// Compute the action plan for one cycle.
pub fn plan(remote: &RemoteLists, inventory: &Inventory, config: &SyncConfig) -> Plan {
    let mut builder = PlanBuilder::default();

    let deduped = stages::resolve_duplicates(inventory, config, &mut builder);
    let view = stages::supersede_relives(deduped, remote.releases.as_deref(), config, &mut builder);
    if let Some(releases) = &remote.releases {
        stages::reconcile_releases(&view, releases, config, &mut builder);
    }
    if let Some(relive) = &remote.relive {
        stages::reconcile_relives(&view, relive, remote.releases.as_deref(), config, &mut builder);
    }
    stages::handle_partials(&view, remote, config, &mut builder);

    let plan = builder.finish();
    info!(
        "Planned {} action(s): {} download, {} rename, {} delete, {} skip",
        plan.len(),
        plan.count(ActionKind::Download),
        plan.count(ActionKind::Rename),
        plan.count(ActionKind::Delete),
        plan.count(ActionKind::Skip)
    );
    plan
}

/// Accumulates actions while keeping every touched path unique.
///
/// Slots are `Option` so a pending delete can be retracted when a later
/// write targets the same path.
#[derive(Debug, Default)]
pub(crate) struct PlanBuilder {
    slots: Vec<Option<Action>>,
    pending_deletes: HashMap<PathBuf, usize>,
    written: HashSet<PathBuf>,
    downloads: HashMap<PathBuf, usize>,
}

impl PlanBuilder {
    /// Whether some earlier action already writes to `path`.
    pub(crate) fn is_written(&self, path: &Path) -> bool {
        self.written.contains(path)
    }

    pub(crate) fn is_pending_delete(&self, path: &Path) -> bool {
        self.pending_deletes.contains_key(path)
    }

    pub(crate) fn skip(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.slots.push(Some(Action {
            operation: Operation::Skip {
                subject: subject.into(),
            },
            reason: reason.into(),
        }));
    }

    pub(crate) fn delete(&mut self, path: &Path, reason: impl Into<String>) {
        if self.written.contains(path) || self.pending_deletes.contains_key(path) {
            debug!("Not deleting {}: already claimed by another action", path.display());
            return;
        }
        self.pending_deletes
            .insert(path.to_path_buf(), self.slots.len());
        self.slots.push(Some(Action {
            operation: Operation::Delete {
                path: path.to_path_buf(),
            },
            reason: reason.into(),
        }));
    }

    pub(crate) fn download(&mut self, job: DownloadJob, reason: impl Into<String>) {
        self.claim_for_write(&job.destination);
        self.downloads
            .insert(job.destination.clone(), self.slots.len());
        self.slots.push(Some(Action {
            operation: Operation::Download(job),
            reason: reason.into(),
        }));
    }

    pub(crate) fn rename(&mut self, from: &Path, to: &Path, reason: impl Into<String>) {
        self.claim_for_write(to);
        self.written.insert(from.to_path_buf());
        self.slots.push(Some(Action {
            operation: Operation::Rename {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            },
            reason: reason.into(),
        }));
    }

    /// Attach an existing partial to the download that will finish it.
    /// Returns false if no download targets `destination`.
    pub(crate) fn attach_resume(&mut self, destination: &Path, partial: &LocalFile) -> bool {
        let Some(slot) = self.downloads.get(destination).copied() else {
            return false;
        };
        match self.slots.get_mut(slot) {
            Some(Some(Action {
                operation: Operation::Download(job),
                ..
            })) => {
                job.resume = Some(partial.clone());
                true
            }
            _ => false,
        }
    }

    fn claim_for_write(&mut self, path: &Path) {
        if let Some(slot) = self.pending_deletes.remove(path) {
            debug!("Retracting delete of {}: it will be overwritten", path.display());
            self.slots[slot] = None;
        }
        self.written.insert(path.to_path_buf());
    }

    pub(crate) fn finish(self) -> Plan {
        Plan {
            actions: self.slots.into_iter().flatten().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::classify;
    use crate::layout::CollectionLayout;
    use crate::models::{MediaFormat, Source};
    use crate::title::normalize_title;
    use std::collections::BTreeSet;
    use std::time::{Duration, SystemTime};

    fn layout() -> CollectionLayout {
        CollectionLayout::new("/c", "39c3")
    }

    fn file_at(subset: Source, name: &str, size: u64, modified_secs: u64) -> LocalFile {
        let (state, format) = classify(name).unwrap();
        LocalFile {
            path: layout().subset_dir(subset).join(name),
            subset,
            state,
            format,
            normalized_title: normalize_title(name),
            size_on_disk: size,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(modified_secs),
        }
    }

    fn file(subset: Source, name: &str, size: u64) -> LocalFile {
        file_at(subset, name, size, 1_000)
    }

    fn release(title: &str, size: u64) -> RemoteItem {
        RemoteItem::release(
            title,
            format!("https://cdn.example/{}.mp4", title.len()),
            MediaFormat::Mp4,
            Some(size),
        )
    }

    fn relive(title: &str) -> RemoteItem {
        RemoteItem::relive(title, format!("https://cdn.example/relive/{}.mp4", title.len()))
    }

    fn run(remote: &RemoteLists, files: Vec<LocalFile>, config: &SyncConfig) -> Plan {
        plan(remote, &Inventory::from_files(layout(), files), config)
    }

    fn reasons(plan: &Plan, kind: ActionKind) -> Vec<(String, String)> {
        plan.actions()
            .iter()
            .filter(|a| a.kind() == kind)
            .map(|a| (a.subject(), a.reason.clone()))
            .collect()
    }

    /// Simulate a fully successful execution of `plan` on `files`.
    fn apply(mut files: Vec<LocalFile>, plan: &Plan) -> Vec<LocalFile> {
        fn name_of(path: &Path) -> String {
            path.file_name().unwrap().to_str().unwrap().to_string()
        }
        for action in plan.actions() {
            match &action.operation {
                Operation::Delete { path } => files.retain(|f| &f.path != path),
                Operation::Rename { from, to } => {
                    let moved = files.iter().find(|f| &f.path == from).cloned().unwrap();
                    files.retain(|f| &f.path != from && &f.path != to);
                    files.push(file(moved.subset, &name_of(to), moved.size_on_disk));
                }
                Operation::Download(job) => {
                    files.retain(|f| f.path != job.destination && f.path != job.partial_path());
                    let size = job.item.expected_size.unwrap_or(1);
                    files.push(file(job.item.source, &name_of(&job.destination), size));
                }
                Operation::Skip { .. } => {}
            }
        }
        files
    }

    fn assert_paths_distinct(plan: &Plan) {
        let mut seen = BTreeSet::new();
        for action in plan.actions() {
            for path in action.touched_paths() {
                assert!(seen.insert(path.to_path_buf()), "{} touched twice", path.display());
            }
        }
    }

    fn messy_collection() -> (RemoteLists, Vec<LocalFile>) {
        let remote = RemoteLists::new(
            Some(vec![
                release("Intro To Things", 100),
                release("Hacking: The Next Level", 200),
                release("Lockpicking Part 2", 300),
                release("New Talk", 50),
            ]),
            Some(vec![
                relive("Opening Ceremony"),
                relive("Intro To Things (39c3)"),
                relive("Closing Ceremony"),
            ]),
        );
        let files = vec![
            file_at(Source::Release, "Intro To Things.mp4", 100, 500),
            file_at(Source::Release, "Intro_ To Things.mp4", 100, 100),
            file(Source::Release, "Hacking - The Next Level.mp4", 200),
            file(Source::Release, "Lockpicking Part 2.mp4", 120),
            file(Source::Release, "Lockpicking Part 2.mp4.part", 40),
            file(Source::Release, "Stale Talk.mp4", 10),
            file(Source::Relive, "Opening Ceremony.mp4", 999),
            file(Source::Relive, "Hacking The Next Level.mp4", 999),
            file(Source::Relive, "Old Stream.mp4.part", 5),
        ];
        (remote, files)
    }

    #[test]
    fn test_empty_collection_downloads_everything() {
        let remote = RemoteLists::new(
            Some(vec![release("Intro To Things", 100)]),
            Some(vec![relive("Opening Ceremony")]),
        );
        let plan = run(&remote, Vec::new(), &SyncConfig::default());

        let destinations: Vec<PathBuf> = plan.downloads().map(|j| j.destination.clone()).collect();
        assert_eq!(
            destinations,
            vec![
                PathBuf::from("/c/39c3/releases/Intro To Things.mp4"),
                PathBuf::from("/c/39c3/relive/Opening Ceremony.mp4"),
            ]
        );
        assert!(plan.downloads().all(|j| j.resume.is_none()));
    }

    #[test]
    fn test_messy_collection_plan() {
        let (remote, files) = messy_collection();
        let plan = run(&remote, files, &SyncConfig::default());
        assert_paths_distinct(&plan);

        assert_eq!(plan.count(ActionKind::Download), 3);
        assert_eq!(plan.count(ActionKind::Rename), 2);
        assert_eq!(plan.count(ActionKind::Delete), 2);

        // The duplicate delete was retracted in favour of renaming the keeper onto it.
        let renames = reasons(&plan, ActionKind::Rename);
        assert!(renames.contains(&(
            "Intro_ To Things.mp4 -> Intro To Things.mp4".to_string(),
            "title changed".to_string()
        )));

        let deletes = reasons(&plan, ActionKind::Delete);
        assert!(deletes
            .iter()
            .any(|(subject, reason)| subject == "Hacking The Next Level.mp4" && reason.contains("superseded")));
        assert!(deletes.contains(&(
            "Old Stream.mp4.part".to_string(),
            "orphaned partial download".to_string()
        )));

        let lockpicking = plan
            .downloads()
            .find(|j| j.item.title == "Lockpicking Part 2")
            .unwrap();
        assert_eq!(lockpicking.resume_offset(), 40);

        let skips = reasons(&plan, ActionKind::Skip);
        assert!(skips.contains(&("Opening Ceremony".to_string(), "already downloaded".to_string())));
        assert!(skips.contains(&(
            "Intro To Things (39c3)".to_string(),
            "superseded by release".to_string()
        )));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let (remote, files) = messy_collection();
        let mut reversed = files.clone();
        reversed.reverse();
        let config = SyncConfig::default();
        assert_eq!(run(&remote, files, &config), run(&remote, reversed, &config));
    }

    #[test]
    fn test_applying_plan_converges() {
        let (remote, files) = messy_collection();
        let config = SyncConfig::default();
        let first = run(&remote, files.clone(), &config);
        assert!(!first.is_converged());

        let after = apply(files, &first);
        let second = run(&remote, after.clone(), &config);
        assert!(second.is_converged(), "{:#?}", second.actions());

        // Stale files are never silently deleted.
        assert!(after.iter().any(|f| f.file_name() == "Stale Talk.mp4"));
    }

    #[test]
    fn test_duplicate_keeper_is_longer_name() {
        let remote = RemoteLists::new(Some(vec![release("Intro_ To Things", 100)]), Some(Vec::new()));
        let files = vec![
            file_at(Source::Release, "Intro To Things.mp4", 100, 900),
            file_at(Source::Release, "Intro_ To Things.mp4", 100, 100),
        ];
        let plan = run(&remote, files, &SyncConfig::default());
        assert_eq!(
            reasons(&plan, ActionKind::Delete),
            vec![(
                "Intro To Things.mp4".to_string(),
                "duplicate, shorter filename".to_string()
            )]
        );
        assert!(reasons(&plan, ActionKind::Skip)
            .contains(&("Intro_ To Things".to_string(), "already downloaded".to_string())));
    }

    #[test]
    fn test_cleanup_off_never_deletes() {
        let (remote, files) = messy_collection();
        let config = SyncConfig::default().with_cleanup(false);
        let plan = run(&remote, files.clone(), &config);
        assert_eq!(plan.count(ActionKind::Delete), 0);
        assert_paths_distinct(&plan);

        let second = run(&remote, apply(files, &plan), &config);
        assert!(second.is_converged(), "{:#?}", second.actions());
    }

    #[test]
    fn test_corrupt_file_redownloaded() {
        let remote = RemoteLists::new(Some(vec![release("Keynote Of Doom", 1_000)]), None);

        let same_path = run(
            &remote,
            vec![file(Source::Release, "Keynote Of Doom.mp4", 999)],
            &SyncConfig::default(),
        );
        assert_eq!(same_path.count(ActionKind::Download), 1);
        assert_eq!(same_path.count(ActionKind::Delete), 0);
        assert!(same_path.actions()[0].reason.contains("size mismatch"));

        let drifted = run(
            &remote,
            vec![file(Source::Release, "Keynote of Doom!.mp4", 999)],
            &SyncConfig::default(),
        );
        assert_paths_distinct(&drifted);
        assert_eq!(drifted.count(ActionKind::Download), 1);
        assert_eq!(reasons(&drifted, ActionKind::Delete)[0].0, "Keynote of Doom!.mp4");
    }

    #[test]
    fn test_unknown_size_skips_size_check() {
        let mut item = release("Keynote", 1);
        item.expected_size = None;
        let remote = RemoteLists::new(Some(vec![item]), None);
        let plan = run(&remote, vec![file(Source::Release, "Keynote.mp4", 5)], &SyncConfig::default());
        assert!(plan.is_converged());
    }

    #[test]
    fn test_quality_filters_release_items() {
        let remote = RemoteLists::new(
            Some(vec![
                release("Talk", 10),
                RemoteItem::release("Talk", "https://cdn.example/talk.opus", MediaFormat::Opus, Some(5)),
            ]),
            None,
        );
        let config = SyncConfig::default().with_quality(crate::config::Quality::Opus);
        let plan = run(&remote, vec![file(Source::Release, "Talk.mp4", 10)], &config);
        let job = plan.downloads().next().unwrap();
        assert_eq!(job.destination, PathBuf::from("/c/39c3/releases/Talk.opus"));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_relive_found_via_release() {
        let remote = RemoteLists::new(None, Some(vec![relive("Keynote Panel")]));
        let plan = run(&remote, vec![file(Source::Release, "Keynote Panel.webm", 5)], &SyncConfig::default());
        assert_eq!(
            reasons(&plan, ActionKind::Skip),
            vec![("Keynote Panel".to_string(), "already have it via release".to_string())]
        );
    }

    #[test]
    fn test_failed_source_keeps_partials() {
        let files = vec![
            file(Source::Release, "Gone.mp4.part", 10),
            file(Source::Relive, "Stream.mp4.part", 10),
        ];
        let remote = RemoteLists::new(None, Some(Vec::new()));
        let plan = run(&remote, files, &SyncConfig::default());
        assert_eq!(
            reasons(&plan, ActionKind::Delete),
            vec![("Stream.mp4.part".to_string(), "orphaned partial download".to_string())]
        );
    }

    #[test]
    fn test_duplicate_destination_skipped() {
        let remote = RemoteLists::new(
            Some(vec![release("What?", 10), release("What*", 20)]),
            None,
        );
        let plan = run(&remote, Vec::new(), &SyncConfig::default());
        assert_eq!(plan.count(ActionKind::Download), 1);
        assert_eq!(
            reasons(&plan, ActionKind::Skip),
            vec![("What*".to_string(), "duplicate destination".to_string())]
        );
    }

    #[test]
    fn test_file_at_own_destination_is_not_taken_by_same_key_item() {
        let remote = RemoteLists::new(
            Some(vec![release("Talk: Intro", 10), release("Talk - Intro", 10)]),
            None,
        );
        let files = vec![file(Source::Release, "Talk - Intro.mp4", 10)];
        let plan = run(&remote, files.clone(), &SyncConfig::default());

        assert_eq!(
            reasons(&plan, ActionKind::Download),
            vec![("Talk: Intro".to_string(), "new release".to_string())]
        );
        assert_eq!(
            reasons(&plan, ActionKind::Skip),
            vec![("Talk - Intro".to_string(), "already downloaded".to_string())]
        );
        assert_eq!(plan.count(ActionKind::Rename), 0);

        let after = apply(files, &plan);
        assert!(run(&remote, after, &SyncConfig::default()).is_converged());
    }

    #[test]
    fn test_plural_drift_supersedes_relive() {
        let remote = RemoteLists::new(
            Some(vec![release("Opening Ceremony", 10)]),
            Some(vec![relive("Opening Ceremonies")]),
        );
        let files = vec![
            file(Source::Release, "Opening Ceremony.mp4", 10),
            file(Source::Relive, "Opening Ceremonies.mp4", 99),
        ];
        let plan = run(&remote, files, &SyncConfig::default());

        assert_eq!(
            reasons(&plan, ActionKind::Delete),
            vec![(
                "Opening Ceremonies.mp4".to_string(),
                "superseded by release \"Opening Ceremony\"".to_string()
            )]
        );
        assert!(reasons(&plan, ActionKind::Skip)
            .contains(&("Opening Ceremonies".to_string(), "superseded by release".to_string())));
        assert_eq!(plan.count(ActionKind::Download), 0);
    }

    #[test]
    fn test_disabled_relive_plans_nothing_for_relives() {
        let remote = RemoteLists::new(None, Some(vec![relive("Opening Ceremony")]));
        let config = SyncConfig::default().with_relive(false);
        assert!(run(&remote, Vec::new(), &config).is_empty());
    }
}
