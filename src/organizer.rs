// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Organizer: drives classification and execution over a directory or a
//! single new file, and turns each run into one undoable batch.

use glob::{MatchOptions, Pattern};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::boxes::{BoxRegistry, ConfigBoxRegistry};
use crate::config::{CleanOptions, SortOptions};
use crate::events::{EventSender, OrganizerEvent, RunPhase};
use crate::executor::{move_file_unique, ActionExecutor, DestinationLocks, MoveRecord};
use crate::history::{BatchOperation, OperationType, RemovedFile, UndoManager, UndoOutcome};
use crate::recycle_bin::RecycleBin;
use crate::rules::{Classifier, FileMeta};
use crate::watcher::should_process;
use crate::{AppConfig, Result, TidydeskError};

const SMALL_FILE_LIMIT: u64 = 1024 * 1024;
const MEDIUM_FILE_LIMIT: u64 = 10 * 1024 * 1024;
/// Added to the watcher's debounce and settle windows when ignoring restored files
const RESTORE_GRACE: Duration = Duration::from_secs(1);

/// Everything derived from one configuration snapshot
struct Snapshot {
    config: Arc<AppConfig>,
    classifier: Classifier,
    executor: ActionExecutor,
    recycle_bin: RecycleBin,
    reserved: HashSet<String>,
}

/// Outcome of one organize, sort or clean run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub kind: OperationType,
    /// Entries looked at
    pub processed: usize,
    /// Entries moved or removed
    pub changed: usize,
    /// Entries whose processing failed
    pub failed: usize,
    /// Id of the recorded batch, if anything changed
    pub batch_id: Option<String>,
    pub message: String,
}

enum Change {
    Moved(MoveRecord),
    Removed(RemovedFile),
}

#[derive(Clone, Copy)]
enum Listing {
    /// Regular files (and links to them)
    Files,
    /// Regular files plus symlinks, dangling ones included
    FilesAndLinks,
}

/// Removes its directory from the active-run set when dropped
struct RunGuard<'a> {
    active: &'a Mutex<HashSet<PathBuf>>,
    key: PathBuf,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

pub struct Organizer {
    snapshot: RwLock<Arc<Snapshot>>,
    registry_override: Option<Arc<dyn BoxRegistry>>,
    locks: Arc<DestinationLocks>,
    undo: Arc<UndoManager>,
    events: EventSender,
    active_runs: Mutex<HashSet<PathBuf>>,
    /// Files put back by undo, with the instant they stop being ignored as new
    restored: Mutex<HashMap<PathBuf, Instant>>,
}

impl Organizer {
    /// Organizer whose boxes come from the configuration's `desktop_boxes`
    pub fn new(config: Arc<AppConfig>, undo: Arc<UndoManager>, events: EventSender) -> Self {
        Self::build(config, None, undo, events)
    }

    /// Organizer resolving boxes through a host-provided registry
    pub fn with_registry(
        config: Arc<AppConfig>,
        registry: Arc<dyn BoxRegistry>,
        undo: Arc<UndoManager>,
        events: EventSender,
    ) -> Self {
        Self::build(config, Some(registry), undo, events)
    }

    fn build(
        config: Arc<AppConfig>,
        registry_override: Option<Arc<dyn BoxRegistry>>,
        undo: Arc<UndoManager>,
        events: EventSender,
    ) -> Self {
        let locks = Arc::new(DestinationLocks::new());
        let snapshot = Self::make_snapshot(config, registry_override.as_ref(), &locks);
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            registry_override,
            locks,
            undo,
            events,
            active_runs: Mutex::new(HashSet::new()),
            restored: Mutex::new(HashMap::new()),
        }
    }

    fn make_snapshot(
        config: Arc<AppConfig>,
        registry_override: Option<&Arc<dyn BoxRegistry>>,
        locks: &Arc<DestinationLocks>,
    ) -> Snapshot {
        let registry: Arc<dyn BoxRegistry> = match registry_override {
            Some(registry) => Arc::clone(registry),
            None => Arc::new(ConfigBoxRegistry::new(
                config.storage.boxes_dir(),
                &config.desktop_boxes,
            )),
        };
        Snapshot {
            classifier: Classifier::from_config(&config),
            executor: ActionExecutor::new(registry, &config.storage, Arc::clone(locks)),
            recycle_bin: RecycleBin::new(config.storage.recycle_bin_dir()),
            reserved: config.reserved_folder_names(),
            config,
        }
    }

    /// Swap in a new configuration. Runs already in flight finish on the old one.
    pub fn update_config(&self, config: Arc<AppConfig>) -> Result<()> {
        let snapshot = Self::make_snapshot(config, self.registry_override.as_ref(), &self.locks);
        let mut current = self
            .snapshot
            .write()
            .map_err(|_| TidydeskError::Config("Organizer config lock poisoned".to_string()))?;
        *current = Arc::new(snapshot);
        info!("Organizer configuration reloaded ({} rules)", current.classifier.rules().len());
        Ok(())
    }

    fn current(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&*s))
            .map_err(|_| TidydeskError::Config("Organizer config lock poisoned".to_string()))
    }

    pub fn config(&self) -> Result<Arc<AppConfig>> {
        Ok(Arc::clone(&self.current()?.config))
    }

    pub fn undo(&self) -> &Arc<UndoManager> {
        &self.undo
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Classify every file directly inside `dir` and apply matching actions
    pub fn organize_directory(&self, dir: &Path) -> Result<RunSummary> {
        self.run(dir, OperationType::Organize, Listing::Files, |snap, path| {
            Ok(self.organize_entry(snap, path)?.map(Change::Moved))
        })
    }

    /// Classify one newly appeared file. No-op while auto-organize is off.
    pub fn handle_new_file(&self, path: &Path) -> Result<Option<MoveRecord>> {
        let snap = self.current()?;
        if !snap.config.auto_organize_enabled {
            debug!("Auto-organize disabled, ignoring {:?}", path);
            return Ok(None);
        }
        if !path.is_file() || !is_candidate(path, &snap.reserved) || !should_process(path) {
            return Ok(None);
        }
        if self.was_restored(path)? {
            debug!("Ignoring {:?}: just restored by undo", path);
            return Ok(None);
        }

        let record = self.organize_entry(&snap, path)?;
        if let Some(record) = &record {
            self.log_batch(BatchOperation::with_moves(
                OperationType::Organize,
                vec![record.clone()],
            ));
        }
        Ok(record)
    }

    /// Reverse the most recent batch. Files it puts back are not picked up
    /// again by `handle_new_file` while the watcher reports them.
    pub fn undo_last(&self) -> UndoOutcome {
        let quiet = match self.current() {
            Ok(snap) => {
                let watcher = &snap.config.watcher;
                Duration::from_millis(watcher.debounce_ms + watcher.max_settle_ms) + RESTORE_GRACE
            }
            Err(e) => return UndoOutcome::failure(format!("Undo failed: {}", e)),
        };
        // Held across the undo so a concurrent `handle_new_file` waits for the entries
        let mut restored = match self.restored.lock() {
            Ok(restored) => restored,
            Err(_) => return UndoOutcome::failure("Undo failed: restore list lock poisoned".to_string()),
        };

        let outcome = self.undo.undo_last();
        let until = Instant::now() + quiet;
        for path in &outcome.restored_paths {
            restored.insert(restore_key(path), until);
        }
        outcome
    }

    fn was_restored(&self, path: &Path) -> Result<bool> {
        let mut restored = self
            .restored
            .lock()
            .map_err(|_| TidydeskError::Config("Restore list lock poisoned".to_string()))?;
        let now = Instant::now();
        restored.retain(|_, until| *until > now);
        Ok(restored.contains_key(&restore_key(path)))
    }

    /// Move files into subfolders by type, month or size
    pub fn sort_directory(&self, dir: &Path, options: &SortOptions) -> Result<RunSummary> {
        self.run(dir, OperationType::Sort, Listing::Files, |_, path| {
            sort_entry(&self.locks, options, path).map(|r| r.map(Change::Moved))
        })
    }

    /// Move temp files, broken shortcuts and pattern matches into the recycle bin
    pub fn clean_directory(&self, dir: &Path, options: &CleanOptions) -> Result<RunSummary> {
        let patterns = compile_patterns(&options.patterns);
        self.run(dir, OperationType::Clean, Listing::FilesAndLinks, |snap, path| {
            if !should_remove(path, options, &patterns) {
                return Ok(None);
            }
            let backup_path = snap.recycle_bin.safe_delete(path)?;
            Ok(Some(Change::Removed(RemovedFile {
                original_path: path.to_path_buf(),
                backup_path,
            })))
        })
    }

    fn organize_entry(&self, snap: &Snapshot, path: &Path) -> Result<Option<MoveRecord>> {
        let meta = FileMeta::from_path(path)?;
        let Some(rule) = snap.classifier.matching_rule(&meta) else {
            return Ok(None);
        };
        debug!("{:?} matched rule '{}' ({})", path, rule.name, rule.action.kind());

        let record = snap.executor.execute(&rule.action, path)?;
        if let Some(MoveRecord {
            box_id: Some(box_id),
            shortcut_path: Some(shortcut_path),
            ..
        }) = &record
        {
            self.events.emit(OrganizerEvent::ShortcutAssigned {
                box_id: box_id.clone(),
                shortcut_path: shortcut_path.clone(),
            });
        }
        Ok(record)
    }

    fn run<F>(&self, dir: &Path, kind: OperationType, listing: Listing, mut step: F) -> Result<RunSummary>
    where
        F: FnMut(&Snapshot, &Path) -> Result<Option<Change>>,
    {
        let _guard = match self.begin_run(dir) {
            Ok(guard) => guard,
            Err(e) => {
                self.events.emit(OrganizerEvent::RunCompleted(failure_message(kind, &e)));
                return Err(e);
            }
        };
        let snap = match self.current() {
            Ok(snap) => snap,
            Err(e) => {
                self.phase(dir, RunPhase::Failed);
                self.events.emit(OrganizerEvent::RunCompleted(failure_message(kind, &e)));
                return Err(e);
            }
        };

        self.phase(dir, RunPhase::Scanning);
        let entries = match list_entries(dir, &snap.reserved, listing) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Cannot {} {:?}: {}", kind, dir, e);
                self.phase(dir, RunPhase::Failed);
                self.events.emit(OrganizerEvent::RunCompleted(failure_message(kind, &e)));
                return Err(e);
            }
        };

        self.phase(dir, RunPhase::Processing);
        let total = entries.len();
        let mut moved = Vec::new();
        let mut removed = Vec::new();
        let mut failed = 0;

        for (i, path) in entries.iter().enumerate() {
            match step(&snap, path) {
                Ok(Some(Change::Moved(record))) => moved.push(record),
                Ok(Some(Change::Removed(file))) => removed.push(file),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to {} {:?}: {}", kind, path, e);
                    failed += 1;
                }
            }
            self.events.emit(OrganizerEvent::Progress(((i + 1) * 100 / total) as u8));
        }
        if total == 0 {
            self.events.emit(OrganizerEvent::Progress(100));
        }

        self.phase(dir, RunPhase::Aggregating);
        let changed = moved.len() + removed.len();
        let batch = BatchOperation {
            moved_files: moved,
            removed_files: removed,
            ..BatchOperation::new(kind)
        };
        let batch_id = if batch.is_empty() {
            None
        } else {
            let id = batch.id.clone();
            self.log_batch(batch);
            Some(id)
        };

        let mut message = match kind {
            OperationType::Organize => format!("Organization complete. Moved: {}.", changed),
            OperationType::Sort => format!("Sorting complete. Moved: {}.", changed),
            OperationType::Clean => format!("Cleaning complete. Removed: {}.", changed),
        };
        if failed > 0 {
            message.push_str(&format!(" Failed: {}.", failed));
        }
        info!("{} ({:?})", message, dir);

        self.phase(dir, RunPhase::Completed);
        self.events.emit(OrganizerEvent::RunCompleted(message.clone()));

        Ok(RunSummary {
            kind,
            processed: total,
            changed,
            failed,
            batch_id,
            message,
        })
    }

    /// Reject a second run over a directory that already has one in flight
    fn begin_run(&self, dir: &Path) -> Result<RunGuard<'_>> {
        let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let mut active = self
            .active_runs
            .lock()
            .map_err(|_| TidydeskError::Config("Run lock poisoned".to_string()))?;
        if !active.insert(key.clone()) {
            warn!("Rejecting run for {:?}: another run is in progress", dir);
            return Err(TidydeskError::RunInProgress(dir.to_path_buf()));
        }
        Ok(RunGuard {
            active: &self.active_runs,
            key,
        })
    }

    fn log_batch(&self, batch: BatchOperation) {
        match self.undo.record(batch.clone()) {
            Ok(()) => self.events.emit(OrganizerEvent::OperationLogged(batch)),
            Err(e) => error!("Batch {} could not be saved to undo history: {}", batch.id, e),
        }
    }

    fn phase(&self, dir: &Path, phase: RunPhase) {
        self.events.emit(OrganizerEvent::Phase {
            dir: dir.to_path_buf(),
            phase,
        });
    }
}

fn failure_message(kind: OperationType, e: &TidydeskError) -> String {
    let what = match kind {
        OperationType::Organize => "Organization",
        OperationType::Sort => "Sorting",
        OperationType::Clean => "Cleaning",
    };
    format!("{} failed: {}", what, e)
}

/// Watcher paths and undo paths may spell the same directory differently
fn restore_key(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Entries of `dir` a run may touch, in enumeration order
fn list_entries(dir: &Path, reserved: &HashSet<String>, listing: Listing) -> Result<Vec<PathBuf>> {
    let unavailable = |source| TidydeskError::DirectoryUnavailable {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(unavailable)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {:?}: {}", dir, e);
                continue;
            }
        };
        let path = entry.path();
        if !is_candidate(&path, reserved) {
            continue;
        }
        let wanted = match listing {
            Listing::Files => path.is_file(),
            Listing::FilesAndLinks => entry
                .file_type()
                .map(|t| t.is_file() || t.is_symlink())
                .unwrap_or(false),
        };
        if wanted {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Not hidden, not shell metadata, not a category or box folder
fn is_candidate(path: &Path, reserved: &HashSet<String>) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    if ["desktop.ini", "thumbs.db"].iter().any(|n| name.eq_ignore_ascii_case(n)) {
        return false;
    }
    !reserved.contains(&name.to_lowercase())
}

/// Subfolder name for a file under the first enabled sort criterion
fn sort_folder(path: &Path, options: &SortOptions) -> Result<Option<String>> {
    if options.by_type {
        let folder = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "NoExtension".to_string());
        return Ok(Some(folder));
    }
    if options.by_date {
        let modified = fs::metadata(path)?.modified()?;
        let month = chrono::DateTime::<chrono::Local>::from(modified).format("%Y-%m");
        return Ok(Some(month.to_string()));
    }
    if options.by_size {
        let size = fs::metadata(path)?.len();
        let bucket = if size < SMALL_FILE_LIMIT {
            "Small"
        } else if size < MEDIUM_FILE_LIMIT {
            "Medium"
        } else {
            "Large"
        };
        return Ok(Some(bucket.to_string()));
    }
    Ok(None)
}

fn sort_entry(locks: &DestinationLocks, options: &SortOptions, path: &Path) -> Result<Option<MoveRecord>> {
    if !should_process(path) {
        return Ok(None);
    }
    let Some(folder) = sort_folder(path, options)? else {
        return Ok(None);
    };
    let target_dir = path.parent().unwrap_or_else(|| Path::new(".")).join(folder);
    fs::create_dir_all(&target_dir)?;
    let new_path = locks.with_lock(&target_dir, || move_file_unique(path, &target_dir))??;
    debug!("Sorted {:?} -> {:?}", path, new_path);
    Ok(Some(MoveRecord::moved(path.to_path_buf(), new_path)))
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("Ignoring invalid clean pattern '{}': {}", p, e);
                None
            }
        })
        .collect()
}

fn should_remove(path: &Path, options: &CleanOptions, patterns: &[Pattern]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if options.remove_broken_shortcuts && is_broken_shortcut(path) {
        return true;
    }
    if options.remove_temp_files && name.starts_with('~') {
        return true;
    }
    let match_options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    patterns.iter().any(|p| p.matches_with(&name, match_options))
}

/// A symlink whose target no longer exists
fn is_broken_shortcut(path: &Path) -> bool {
    let is_link = path
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    is_link && fs::metadata(path).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_skip_hidden_metadata_and_reserved() {
        let reserved: HashSet<String> = ["images".to_string()].into_iter().collect();
        assert!(is_candidate(Path::new("/d/a.png"), &reserved));
        assert!(!is_candidate(Path::new("/d/.hidden"), &reserved));
        assert!(!is_candidate(Path::new("/d/Desktop.ini"), &reserved));
        assert!(!is_candidate(Path::new("/d/Images"), &reserved));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_are_candidates() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let reserved = HashSet::new();
        let latin1 = Path::new("/d").join(OsStr::from_bytes(b"caf\xe9.png"));
        assert!(is_candidate(&latin1, &reserved));
        let hidden = Path::new("/d").join(OsStr::from_bytes(b".caf\xe9"));
        assert!(!is_candidate(&hidden, &reserved));
    }

    #[test]
    fn test_restore_key_resolves_parent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dotted = tmp.path().join(".").join("a.png");
        assert_eq!(restore_key(&dotted), restore_key(&tmp.path().join("a.png")));
        assert_eq!(restore_key(Path::new("/missing/dir/a.png")), PathBuf::from("/missing/dir/a.png"));
    }

    #[test]
    fn test_unreadable_config_still_completes_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        let desk = tmp.path().join("desk");
        fs::create_dir_all(&desk).unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = tmp.path().join("data").to_string_lossy().to_string();
        let undo = Arc::new(UndoManager::from_config(&config).unwrap());
        let events = EventSender::new();
        let organizer = Organizer::new(Arc::new(config), undo, events.clone());
        let mut rx = events.subscribe();

        std::thread::scope(|s| {
            let poisoner = s.spawn(|| {
                let _guard = organizer.snapshot.write().unwrap();
                panic!("config writer died");
            });
            assert!(poisoner.join().is_err());
        });

        let err = organizer.organize_directory(&desk).unwrap_err();
        assert!(matches!(err, TidydeskError::Config(_)));
        let events = crate::events::drain(&mut rx);
        assert!(events.iter().any(
            |e| matches!(e, OrganizerEvent::RunCompleted(m) if m.starts_with("Organization failed"))
        ));
        // The run slot was released, so the next attempt fails the same way
        assert!(matches!(organizer.organize_directory(&desk), Err(TidydeskError::Config(_))));
    }

    #[test]
    fn test_sort_folder_by_type() {
        let options = SortOptions::default();
        assert_eq!(sort_folder(Path::new("/d/A.PDF"), &options).unwrap(), Some("pdf".to_string()));
        assert_eq!(
            sort_folder(Path::new("/d/Makefile"), &options).unwrap(),
            Some("NoExtension".to_string())
        );
        let none = SortOptions { by_type: false, by_date: false, by_size: false };
        assert_eq!(sort_folder(Path::new("/d/a.txt"), &none).unwrap(), None);
    }

    #[test]
    fn test_should_remove() {
        let options = CleanOptions {
            remove_broken_shortcuts: false,
            remove_temp_files: true,
            patterns: vec!["*.log".to_string()],
        };
        let patterns = compile_patterns(&options.patterns);
        assert!(should_remove(Path::new("/d/~$draft.docx"), &options, &patterns));
        assert!(should_remove(Path::new("/d/BUILD.LOG"), &options, &patterns));
        assert!(!should_remove(Path::new("/d/notes.txt"), &options, &patterns));
    }

    #[test]
    fn test_invalid_patterns_dropped() {
        let patterns = compile_patterns(&["[".to_string(), "*.tmp".to_string()]);
        assert_eq!(patterns.len(), 1);
    }
}
