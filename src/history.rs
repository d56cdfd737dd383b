// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! History management for undo support.
//!
//! Every organize, sort or clean run that changes something produces one
//! [`BatchOperation`]. Batches sit on a bounded stack that is persisted as an
//! append-only JSONL log: a `recorded` line when a batch is pushed, a
//! `removed` line when it is undone or evicted. Replaying the log rebuilds
//! the stack; the log is compacted once it grows well past the stack size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::executor::{move_file_to, set_hidden, MoveRecord, RecordAction};
use crate::recycle_bin::RecycleBin;
use crate::{AppConfig, Result, TidydeskError};

/// Kind of run a batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Organize,
    Sort,
    Clean,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Organize => "organize",
            OperationType::Sort => "sort",
            OperationType::Clean => "clean",
        };
        f.write_str(name)
    }
}

/// A file moved into the recycle bin by a clean run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedFile {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
}

/// The undo unit: everything one run changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub moved_files: Vec<MoveRecord>,
    #[serde(default)]
    pub removed_files: Vec<RemovedFile>,
}

impl BatchOperation {
    pub fn new(kind: OperationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            moved_files: Vec::new(),
            removed_files: Vec::new(),
        }
    }

    pub fn with_moves(kind: OperationType, moved_files: Vec<MoveRecord>) -> Self {
        Self {
            moved_files,
            ..Self::new(kind)
        }
    }

    pub fn with_removals(removed_files: Vec<RemovedFile>) -> Self {
        Self {
            removed_files,
            ..Self::new(OperationType::Clean)
        }
    }

    /// Number of files touched
    pub fn len(&self) -> usize {
        self.moved_files.len() + self.removed_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Line format of the history log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Recorded { batch: BatchOperation },
    Removed { id: String },
}

/// Append-only persistence for the undo stack
struct HistoryLog {
    path: PathBuf,
    lines: usize,
}

impl HistoryLog {
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;
        self.lines += 1;

        Ok(())
    }

    /// Rebuild the stack (oldest first) from the log
    fn replay(&self) -> Result<Vec<BatchOperation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut stack: Vec<BatchOperation> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(LogEntry::Recorded { batch }) => stack.push(batch),
                Ok(LogEntry::Removed { id }) => stack.retain(|b| b.id != id),
                Err(e) => {
                    warn!("Failed to parse history entry: {}", e);
                }
            }
        }

        Ok(stack)
    }

    /// Replace the log with one `recorded` line per live batch
    fn compact(&mut self, stack: &[BatchOperation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for batch in stack {
                let entry = LogEntry::Recorded { batch: batch.clone() };
                writeln!(writer, "{}", serde_json::to_string(&entry)?)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.lines = stack.len();
        Ok(())
    }
}

struct UndoState {
    stack: Vec<BatchOperation>,
    log: HistoryLog,
}

impl UndoState {
    /// Drop the oldest batches past `max_entries`. The batch being recorded is
    /// already persisted, so log failures here are logged, not returned.
    fn evict_past(&mut self, max_entries: usize) {
        let mut needs_compact = false;
        while self.stack.len() > max_entries {
            let oldest = self.stack.remove(0);
            info!("Evicted oldest undo batch {} ({})", oldest.id, oldest.kind);
            if needs_compact {
                continue;
            }
            if let Err(e) = self.log.append(&LogEntry::Removed { id: oldest.id.clone() }) {
                // A stale `recorded` line would bring the batch back on replay
                warn!("Could not log eviction of {}, rewriting history: {}", oldest.id, e);
                needs_compact = true;
            }
        }

        if needs_compact || self.log.lines > max_entries * 4 + 16 {
            if let Err(e) = self.log.compact(&self.stack) {
                // `open` trims the replayed stack to capacity, so the log heals on restart
                warn!("Could not compact undo history {:?}: {}", self.log.path, e);
            }
        }
    }
}

/// What `undo_last` reports back to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoOutcome {
    pub success: bool,
    pub message: String,
    pub restored: usize,
    /// Files that could not be found where the batch left them
    pub skipped: Vec<PathBuf>,
    /// Where restored files actually landed
    pub restored_paths: Vec<PathBuf>,
}

impl UndoOutcome {
    pub(crate) fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            restored: 0,
            skipped: Vec::new(),
            restored_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct UndoReport {
    restored: usize,
    skipped: Vec<PathBuf>,
    landed: Vec<PathBuf>,
}

/// Bounded, persisted stack of batch operations
pub struct UndoManager {
    state: Mutex<UndoState>,
    max_entries: usize,
    recycle_bin: RecycleBin,
}

impl UndoManager {
    /// Open (or create) the history at `path`
    pub fn open(path: impl Into<PathBuf>, max_entries: usize, recycle_bin: RecycleBin) -> Result<Self> {
        let max_entries = max_entries.max(1);
        let mut log = HistoryLog {
            path: path.into(),
            lines: 0,
        };

        let mut stack = log.replay()?;
        if stack.len() > max_entries {
            let excess = stack.len() - max_entries;
            stack.drain(..excess);
        }
        if log.path.exists() {
            log.compact(&stack)?;
        }
        info!("Undo history loaded: {} batch(es) from {:?}", stack.len(), log.path);

        Ok(Self {
            state: Mutex::new(UndoState { stack, log }),
            max_entries,
            recycle_bin,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::open(
            config.history_path(),
            config.history.max_entries,
            RecycleBin::new(config.storage.recycle_bin_dir()),
        )
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, UndoState>> {
        self.state
            .lock()
            .map_err(|_| TidydeskError::Config("Undo history lock poisoned".to_string()))
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn path(&self) -> Result<PathBuf> {
        Ok(self.lock_state()?.log.path.clone())
    }

    /// Push a batch, evicting the oldest past capacity. Empty batches are ignored.
    pub fn record(&self, batch: BatchOperation) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.lock_state()?;
        state.log.append(&LogEntry::Recorded { batch: batch.clone() })?;
        info!("Operation '{}' added to undo history ({} file(s))", batch.kind, batch.len());
        state.stack.push(batch);
        state.evict_past(self.max_entries);

        Ok(())
    }

    /// Snapshot of the stack, oldest first
    pub fn entries(&self) -> Result<Vec<BatchOperation>> {
        Ok(self.lock_state()?.stack.clone())
    }

    /// The batch `undo_last` would reverse
    pub fn last(&self) -> Result<BatchOperation> {
        self.lock_state()?
            .stack
            .last()
            .cloned()
            .ok_or(TidydeskError::HistoryEmpty)
    }

    pub fn len(&self) -> usize {
        self.lock_state().map(|s| s.stack.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all history (files stay where they are)
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        state.stack.clear();
        let UndoState { stack, log } = &mut *state;
        log.compact(stack)
    }

    /// Reverse the most recent batch. Always yields one terminal message.
    pub fn undo_last(&self) -> UndoOutcome {
        let mut state = match self.lock_state() {
            Ok(state) => state,
            Err(e) => return UndoOutcome::failure(format!("Undo failed: {}", e)),
        };

        let Some(batch) = state.stack.pop() else {
            warn!("Undo history is empty, nothing to undo");
            return UndoOutcome::failure("Undo history is empty.".to_string());
        };

        match self.reverse(&batch) {
            Ok(report) => {
                if let Err(e) = state.log.append(&LogEntry::Removed { id: batch.id.clone() }) {
                    warn!("Undo succeeded but history log was not updated: {}", e);
                }
                let mut message = format!(
                    "Operation '{}' undone: {} file(s) restored.",
                    batch.kind, report.restored
                );
                if !report.skipped.is_empty() {
                    message.push_str(&format!(" {} file(s) could not be found.", report.skipped.len()));
                }
                info!("{}", message);
                UndoOutcome {
                    success: true,
                    message,
                    restored: report.restored,
                    skipped: report.skipped,
                    restored_paths: report.landed,
                }
            }
            Err(e) => {
                log_failed_undo(&batch, &e);
                let restored = match &e {
                    TidydeskError::UndoIncomplete { restored, .. } => *restored,
                    _ => 0,
                };
                state.stack.push(batch);
                UndoOutcome {
                    success: false,
                    message: format!("Undo failed: {}", e),
                    restored,
                    skipped: Vec::new(),
                    restored_paths: Vec::new(),
                }
            }
        }
    }

    fn reverse(&self, batch: &BatchOperation) -> Result<UndoReport> {
        match batch.kind {
            OperationType::Organize | OperationType::Sort => reverse_moves(&batch.moved_files),
            OperationType::Clean => self.reverse_removals(&batch.removed_files),
        }
    }

    fn reverse_removals(&self, removed: &[RemovedFile]) -> Result<UndoReport> {
        let mut report = UndoReport::default();
        for file in removed.iter().rev() {
            if !file.backup_path.exists() {
                warn!("Backup for {:?} not found at {:?}", file.original_path, file.backup_path);
                report.skipped.push(file.backup_path.clone());
                continue;
            }
            let landed = self
                .recycle_bin
                .restore(&file.backup_path, &file.original_path)
                .map_err(|e| TidydeskError::UndoIncomplete {
                    restored: report.restored,
                    reason: format!("{:?}: {}", file.backup_path, e),
                })?;
            report.restored += 1;
            report.landed.push(landed);
        }
        Ok(report)
    }
}

fn log_failed_undo(batch: &BatchOperation, e: &TidydeskError) {
    tracing::error!("Undo of '{}' batch {} failed, keeping it on the stack: {}", batch.kind, batch.id, e);
}

fn reverse_moves(moved: &[MoveRecord]) -> Result<UndoReport> {
    let mut report = UndoReport::default();
    for record in moved.iter().rev() {
        if record.action == RecordAction::Assign {
            remove_shortcut(record);
            if record.hidden {
                unhide(&record.original_path);
            }
            if record.new_path == record.original_path {
                report.restored += 1;
                continue;
            }
        }

        if record.new_path.symlink_metadata().is_err() {
            warn!("File to move back not found: {:?}", record.new_path);
            report.skipped.push(record.new_path.clone());
            continue;
        }

        let landed = move_file_to(&record.new_path, &record.original_path).map_err(|e| {
            TidydeskError::UndoIncomplete {
                restored: report.restored,
                reason: format!("{:?}: {}", record.new_path, e),
            }
        })?;
        if landed != record.original_path {
            warn!("{:?} was occupied, restored as {:?}", record.original_path, landed);
        }
        report.restored += 1;
        report.landed.push(landed);
    }
    Ok(report)
}

fn unhide(path: &Path) {
    if let Err(e) = set_hidden(path, false) {
        warn!("Could not unhide {:?}: {}", path, e);
    }
}

fn remove_shortcut(record: &MoveRecord) {
    let Some(shortcut) = &record.shortcut_path else {
        return;
    };
    let is_link = shortcut
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_link {
        if let Err(e) = fs::remove_file(shortcut) {
            warn!("Could not remove shortcut {:?}: {}", shortcut, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir, max: usize) -> UndoManager {
        UndoManager::open(
            tmp.path().join("undo_history.jsonl"),
            max,
            RecycleBin::new(tmp.path().join("bin")),
        )
        .unwrap()
    }

    /// Move `name` from `desk` into `desk/sub` and return the record
    fn staged_move(desk: &Path, name: &str) -> MoveRecord {
        let original = desk.join(name);
        fs::write(&original, name).unwrap();
        let new_path = desk.join("sub").join(name);
        fs::create_dir_all(new_path.parent().unwrap()).unwrap();
        fs::rename(&original, &new_path).unwrap();
        MoveRecord::moved(original, new_path)
    }

    fn dummy_batch(n: usize) -> BatchOperation {
        BatchOperation::with_moves(
            OperationType::Organize,
            vec![MoveRecord::moved(
                PathBuf::from(format!("/nowhere/{}", n)),
                PathBuf::from(format!("/nowhere/moved/{}", n)),
            )],
        )
    }

    #[test]
    fn test_undo_empty_history() {
        let tmp = TempDir::new().unwrap();
        let outcome = manager(&tmp, 10).undo_last();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Undo history is empty.");
    }

    #[test]
    fn test_record_and_undo_moves() {
        let tmp = TempDir::new().unwrap();
        let desk = tmp.path().join("desk");
        fs::create_dir_all(&desk).unwrap();
        let undo = manager(&tmp, 10);

        let records = vec![staged_move(&desk, "a.txt"), staged_move(&desk, "b.txt")];
        undo.record(BatchOperation::with_moves(OperationType::Sort, records)).unwrap();
        assert_eq!(undo.len(), 1);
        assert_eq!(undo.last().unwrap().kind, OperationType::Sort);

        let outcome = undo.undo_last();
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.restored, 2);
        // newest first
        assert_eq!(outcome.restored_paths, vec![desk.join("b.txt"), desk.join("a.txt")]);
        assert!(desk.join("a.txt").exists());
        assert!(desk.join("b.txt").exists());
        assert!(undo.is_empty());
        assert!(matches!(undo.last(), Err(TidydeskError::HistoryEmpty)));
    }

    #[test]
    fn test_missing_files_are_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let desk = tmp.path().join("desk");
        fs::create_dir_all(&desk).unwrap();
        let undo = manager(&tmp, 10);

        let kept = staged_move(&desk, "kept.txt");
        let lost = staged_move(&desk, "lost.txt");
        fs::remove_file(&lost.new_path).unwrap();
        undo.record(BatchOperation::with_moves(OperationType::Organize, vec![kept, lost]))
            .unwrap();

        let outcome = undo.undo_last();
        assert!(outcome.success);
        assert_eq!(outcome.restored, 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert!(desk.join("kept.txt").exists());
    }

    #[test]
    fn test_failed_undo_keeps_batch_on_stack() {
        let tmp = TempDir::new().unwrap();
        let desk = tmp.path().join("desk");
        fs::create_dir_all(&desk).unwrap();
        let undo = manager(&tmp, 10);

        let first = staged_move(&desk, "first.txt");
        // Parent of this original is a regular file, so restoring it must fail
        fs::write(tmp.path().join("blocker"), "").unwrap();
        let blocked = MoveRecord::moved(
            tmp.path().join("blocker").join("second.txt"),
            staged_move(&desk, "second.txt").new_path,
        );
        undo.record(BatchOperation::with_moves(OperationType::Organize, vec![blocked, first]))
            .unwrap();

        let outcome = undo.undo_last();
        assert!(!outcome.success);
        assert!(outcome.message.contains("incomplete"), "{}", outcome.message);
        assert_eq!(outcome.restored, 1);
        assert_eq!(undo.len(), 1);

        // Reversal runs newest first: `first` was already put back and stays back
        assert!(desk.join("first.txt").exists());
        assert!(desk.join("sub").join("second.txt").exists());
    }

    #[test]
    fn test_history_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let undo = manager(&tmp, 3);
        let batches: Vec<_> = (0..4).map(dummy_batch).collect();
        for b in &batches {
            undo.record(b.clone()).unwrap();
        }

        let ids: Vec<_> = undo.entries().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, batches[1..].iter().map(|b| b.id.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn test_history_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let batches: Vec<_> = (0..5).map(dummy_batch).collect();
        {
            let undo = manager(&tmp, 4);
            for b in &batches {
                undo.record(b.clone()).unwrap();
            }
            // pops batch 4; files are missing so it is skipped but still consumed
            assert!(undo.undo_last().success);
        }

        let reopened = manager(&tmp, 4);
        let ids: Vec<_> = reopened.entries().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, batches[1..4].iter().map(|b| b.id.clone()).collect::<Vec<_>>());

        let smaller = manager(&tmp, 2);
        assert_eq!(smaller.len(), 2);
    }

    #[test]
    fn test_log_is_compacted() {
        let tmp = TempDir::new().unwrap();
        let undo = manager(&tmp, 2);
        for n in 0..40 {
            undo.record(dummy_batch(n)).unwrap();
        }
        let lines = fs::read_to_string(undo.path().unwrap()).unwrap().lines().count();
        assert!(lines <= 2 * 4 + 16 + 2, "log has {} lines", lines);
        assert_eq!(undo.len(), 2);
    }

    #[test]
    fn test_eviction_survives_log_failure() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("history.jsonl");
        // A directory where the log should be makes every write fail
        fs::create_dir_all(&log_path).unwrap();
        let batches: Vec<_> = (0..3).map(dummy_batch).collect();
        let mut state = UndoState {
            stack: batches.clone(),
            log: HistoryLog { path: log_path.clone(), lines: 3 },
        };

        state.evict_past(2);
        assert_eq!(state.stack, batches[1..]);

        // A log that missed the `removed` line is trimmed to capacity on open
        fs::remove_dir(&log_path).unwrap();
        let mut log = HistoryLog { path: log_path.clone(), lines: 0 };
        for batch in &batches {
            log.append(&LogEntry::Recorded { batch: batch.clone() }).unwrap();
        }
        let reopened =
            UndoManager::open(&log_path, 2, RecycleBin::new(tmp.path().join("bin"))).unwrap();
        assert_eq!(reopened.entries().unwrap(), batches[1..]);
    }

    #[cfg(windows)]
    #[test]
    fn test_undo_unhides_assigned_original() {
        use std::os::windows::fs::MetadataExt;
        const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;

        let tmp = TempDir::new().unwrap();
        let undo = manager(&tmp, 10);
        let original = tmp.path().join("desk").join("report.pdf");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, "r").unwrap();
        set_hidden(&original, true).unwrap();
        assert_ne!(fs::metadata(&original).unwrap().file_attributes() & FILE_ATTRIBUTE_HIDDEN, 0);

        let mut record = MoveRecord::assigned(
            original.clone(),
            original.clone(),
            tmp.path().join("boxes").join("report.pdf"),
            "docs",
        );
        record.hidden = true;
        undo.record(BatchOperation::with_moves(OperationType::Organize, vec![record]))
            .unwrap();

        assert!(undo.undo_last().success);
        assert_eq!(fs::metadata(&original).unwrap().file_attributes() & FILE_ATTRIBUTE_HIDDEN, 0);
    }

    #[test]
    fn test_empty_batch_not_recorded() {
        let tmp = TempDir::new().unwrap();
        let undo = manager(&tmp, 10);
        undo.record(BatchOperation::new(OperationType::Organize)).unwrap();
        assert!(undo.is_empty());
    }

    #[test]
    fn test_undo_clean_restores_backups() {
        let tmp = TempDir::new().unwrap();
        let undo = manager(&tmp, 10);
        let bin = RecycleBin::new(tmp.path().join("bin"));
        let original = tmp.path().join("desk").join("~scratch.txt");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, "tmp").unwrap();
        let backup = bin.safe_delete(&original).unwrap();

        undo.record(BatchOperation::with_removals(vec![RemovedFile {
            original_path: original.clone(),
            backup_path: backup,
        }]))
        .unwrap();

        let outcome = undo.undo_last();
        assert!(outcome.success);
        assert_eq!(outcome.restored_paths, vec![original.clone()]);
        assert_eq!(fs::read_to_string(&original).unwrap(), "tmp");
    }

    #[cfg(unix)]
    #[test]
    fn test_undo_assignment_removes_shortcut() {
        let tmp = TempDir::new().unwrap();
        let desk = tmp.path().join("desk");
        fs::create_dir_all(&desk).unwrap();
        let undo = manager(&tmp, 10);

        let moved = staged_move(&desk, "shot.png");
        let shortcut = tmp.path().join("boxes").join("shot.png");
        fs::create_dir_all(shortcut.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&moved.new_path, &shortcut).unwrap();
        let record = MoveRecord::assigned(moved.original_path, moved.new_path, shortcut.clone(), "b");
        undo.record(BatchOperation::with_moves(OperationType::Organize, vec![record]))
            .unwrap();

        assert!(undo.undo_last().success);
        assert!(desk.join("shot.png").exists());
        assert!(shortcut.symlink_metadata().is_err());
    }
}
