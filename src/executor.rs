// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Action execution: collision-safe moves and box shortcuts

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::boxes::BoxRegistry;
use crate::config::StorageConfig;
use crate::rules::Action;
use crate::{Result, TidydeskError};

/// Give up on finding a free `_N` name after this many attempts
const MAX_COLLISION_ATTEMPTS: usize = 10_000;

/// Kind of mutation a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    #[default]
    Move,
    Assign,
}

/// Reversible description of one executed action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    #[serde(default)]
    pub action: RecordAction,
    pub original_path: PathBuf,
    /// Where the file lives now. Equal to `original_path` for an assignment
    /// that only hid the original.
    pub new_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_id: Option<String>,
    /// The original was marked hidden in place and must be unhidden on undo
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl MoveRecord {
    pub fn moved(original_path: PathBuf, new_path: PathBuf) -> Self {
        Self {
            action: RecordAction::Move,
            original_path,
            new_path,
            shortcut_path: None,
            box_id: None,
            hidden: false,
        }
    }

    pub fn assigned(
        original_path: PathBuf,
        new_path: PathBuf,
        shortcut_path: PathBuf,
        box_id: &str,
    ) -> Self {
        Self {
            action: RecordAction::Assign,
            original_path,
            new_path,
            shortcut_path: Some(shortcut_path),
            box_id: Some(box_id.to_string()),
            hidden: false,
        }
    }
}

/// One mutex per destination directory, so name-collision resolution in
/// that directory is serialized while other directories proceed in parallel.
#[derive(Debug, Default)]
pub struct DestinationLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `dir`
    pub fn with_lock<T>(&self, dir: &Path, f: impl FnOnce() -> T) -> Result<T> {
        let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| TidydeskError::Config("Destination lock table poisoned".to_string()))?;
            locks.entry(key).or_default().clone()
        };
        let _guard = lock
            .lock()
            .map_err(|_| TidydeskError::Config(format!("Destination lock poisoned: {:?}", dir)))?;
        Ok(f())
    }
}

type LinkFn = fn(&Path, &Path) -> io::Result<()>;

/// Interprets rule actions against the filesystem
pub struct ActionExecutor {
    registry: Arc<dyn BoxRegistry>,
    storage_dir: PathBuf,
    relocate_assigned: bool,
    locks: Arc<DestinationLocks>,
    link: LinkFn,
}

impl ActionExecutor {
    pub fn new(
        registry: Arc<dyn BoxRegistry>,
        storage: &StorageConfig,
        locks: Arc<DestinationLocks>,
    ) -> Self {
        Self {
            registry,
            storage_dir: storage.storage_dir(),
            relocate_assigned: storage.relocate_assigned,
            locks,
            link: create_symlink,
        }
    }

    pub fn registry(&self) -> &Arc<dyn BoxRegistry> {
        &self.registry
    }

    /// Perform `action` on `source`. `Ok(None)` means nothing changed.
    pub fn execute(&self, action: &Action, source: &Path) -> Result<Option<MoveRecord>> {
        match action {
            Action::MoveTo { path } => self.move_to(path, source),
            Action::AssignToBox { box_id } => self.assign_to_box(box_id, source).map(Some),
            Action::Unsupported => Ok(None),
        }
    }

    fn move_to(&self, destination: &Path, source: &Path) -> Result<Option<MoveRecord>> {
        let parent = source.parent().unwrap_or_else(|| Path::new("."));
        let dest_dir = if destination.is_absolute() {
            destination.to_path_buf()
        } else {
            parent.join(destination)
        };

        fs::create_dir_all(&dest_dir)?;

        if same_dir(parent, &dest_dir) {
            debug!("{:?} already lives in {:?}", source, dest_dir);
            return Ok(None);
        }

        let new_path = self
            .locks
            .with_lock(&dest_dir, || move_file_unique(source, &dest_dir))??;
        info!("Moved {:?} -> {:?}", source, new_path);

        Ok(Some(MoveRecord::moved(source.to_path_buf(), new_path)))
    }

    fn assign_to_box(&self, box_ref: &str, source: &Path) -> Result<MoveRecord> {
        let box_id = self
            .registry
            .canonical_id(box_ref)
            .ok_or_else(|| TidydeskError::UnknownBox(box_ref.to_string()))?;
        let box_id = box_id.as_str();
        let shortcut_dir = self
            .registry
            .resolve_shortcut_dir(box_id)
            .ok_or_else(|| TidydeskError::UnknownBox(box_id.to_string()))?;
        fs::create_dir_all(&shortcut_dir)?;

        let original = absolute_path(source)?;
        let display_name = original
            .file_name()
            .map(OsStr::to_os_string)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "source has no file name"))?;

        let target = if self.relocate_assigned {
            fs::create_dir_all(&self.storage_dir)?;
            let storage_dir = fs::canonicalize(&self.storage_dir)?;
            self.locks
                .with_lock(&storage_dir, || move_file_unique(&original, &storage_dir))??
        } else {
            original.clone()
        };

        let link = self.link;
        let shortcut = self.locks.with_lock(&shortcut_dir, || {
            create_shortcut_unique(link, &target, &shortcut_dir, &display_name)
        })?;

        match shortcut {
            Ok(shortcut_path) => {
                let mut hidden = false;
                if !self.relocate_assigned {
                    match set_hidden(&original, true) {
                        Ok(()) => hidden = true,
                        Err(e) if e.kind() == ErrorKind::Unsupported => {
                            debug!("Leaving {:?} visible: {}", original, e)
                        }
                        Err(e) => warn!("Could not hide {:?}: {}", original, e),
                    }
                }
                info!("Assigned {:?} to box '{}' via {:?}", original, box_id, shortcut_path);
                let mut record = MoveRecord::assigned(original, target, shortcut_path, box_id);
                record.hidden = hidden;
                Ok(record)
            }
            Err(e) if target != original => {
                warn!("Shortcut for {:?} failed, moving original back: {}", original, e);
                match try_move_no_clobber(&target, &original) {
                    Ok(()) => Err(e.into()),
                    Err(rollback) => Err(TidydeskError::Rollback {
                        path: original,
                        stranded: target,
                        reason: format!("{}; rollback: {}", e, rollback),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    fn with_link_fn(mut self, link: LinkFn) -> Self {
        self.link = link;
        self
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    Ok(fs::canonicalize(parent)?.join(name))
}

/// `name`, `stem_1.ext`, `stem_2.ext`, ...
pub fn candidate_name(file_name: &OsStr, attempt: usize) -> PathBuf {
    if attempt == 0 {
        return PathBuf::from(file_name);
    }
    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    match as_path.extension() {
        Some(ext) => PathBuf::from(format!("{}_{}.{}", stem, attempt, ext.to_string_lossy())),
        None => PathBuf::from(format!("{}_{}", stem, attempt)),
    }
}

/// Move `source` into `dest_dir`, suffixing `_1`, `_2`, ... until a free
/// name is found. Each attempt fails atomically on an existing name, so the
/// loop stays correct when other writers create files concurrently.
pub fn move_file_unique(source: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let file_name = source
        .file_name()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "source has no file name"))?;
    move_file_unique_as(source, dest_dir, file_name)
}

pub fn move_file_unique_as(source: &Path, dest_dir: &Path, file_name: &OsStr) -> io::Result<PathBuf> {
    for attempt in 0..MAX_COLLISION_ATTEMPTS {
        let candidate = dest_dir.join(candidate_name(file_name, attempt));
        match try_move_no_clobber(source, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {:?} in {:?}", file_name, dest_dir),
    ))
}

/// Move `source` to `target`, creating parents. If `target` is taken the
/// file lands next to it under a suffixed name; the final path is returned.
pub fn move_file_to(source: &Path, target: &Path) -> io::Result<PathBuf> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    match try_move_no_clobber(source, target) {
        Ok(()) => Ok(target.to_path_buf()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let name = target
                .file_name()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "target has no file name"))?;
            move_file_unique_as(source, parent, name)
        }
        Err(e) => Err(e),
    }
}

/// Move without ever replacing an existing `target`
fn try_move_no_clobber(source: &Path, target: &Path) -> io::Result<()> {
    // link(2) refuses existing targets atomically
    match fs::hard_link(source, target) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(source) {
                let _ = fs::remove_file(target);
                return Err(e);
            }
            return Ok(());
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(e),
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(e),
        Err(_) => {}
    }

    if target.symlink_metadata().is_ok() {
        return Err(io::Error::new(ErrorKind::AlreadyExists, "target exists"));
    }
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => copy_then_remove(source, target),
        Err(e) => Err(e),
    }
}

fn copy_then_remove(source: &Path, target: &Path) -> io::Result<()> {
    let mut input = File::open(source)?;
    let mut output = OpenOptions::new().write(true).create_new(true).open(target)?;
    let copied = io::copy(&mut input, &mut output).and_then(|_| output.sync_all());
    if let Err(e) = copied {
        let _ = fs::remove_file(target);
        return Err(e);
    }
    if let Ok(meta) = input.metadata() {
        let _ = fs::set_permissions(target, meta.permissions());
    }
    drop(input);
    if let Err(e) = fs::remove_file(source) {
        let _ = fs::remove_file(target);
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(18) // EXDEV
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

fn create_shortcut_unique(
    link: LinkFn,
    target: &Path,
    dir: &Path,
    name: &OsStr,
) -> io::Result<PathBuf> {
    for attempt in 0..MAX_COLLISION_ATTEMPTS {
        let candidate = dir.join(candidate_name(name, attempt));
        match link(target, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free shortcut name for {:?} in {:?}", name, dir),
    ))
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(ErrorKind::Unsupported, "symlinks not supported"))
}

/// Set or clear the hidden attribute
#[cfg(windows)]
pub fn set_hidden(path: &Path, hidden: bool) -> io::Result<()> {
    let flag = if hidden { "+H" } else { "-H" };
    let status = std::process::Command::new("attrib").arg(flag).arg(path).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(ErrorKind::PermissionDenied, format!("attrib exited with {}", status)))
    }
}

#[cfg(not(windows))]
pub fn set_hidden(_path: &Path, _hidden: bool) -> io::Result<()> {
    Err(io::Error::new(ErrorKind::Unsupported, "no hidden attribute on this platform"))
}
