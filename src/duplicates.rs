// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Duplicate finder: group by size, then confirm by content hash

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{Result, TidydeskError};

/// Files with identical content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// blake3 hex digest
    pub hash: String,
    pub size: u64,
    /// Sorted, at least two entries
    pub paths: Vec<PathBuf>,
}

/// Calculate file hash for deduplication
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Walk `dir` recursively and return every set of identical files.
/// Symlinks are not followed. Unreadable files are skipped.
pub fn find_duplicates(dir: &Path) -> Result<Vec<DuplicateGroup>> {
    if !dir.is_dir() {
        return Err(TidydeskError::DirectoryUnavailable {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let mut by_size: HashMap<u64, Vec<PathBuf>> = HashMap::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => by_size.entry(meta.len()).or_default().push(entry.into_path()),
            Err(e) => warn!("Cannot stat {:?}: {}", entry.path(), e),
        }
    }

    let mut groups = Vec::new();
    for (size, paths) in by_size.into_iter().filter(|(_, p)| p.len() > 1) {
        let mut by_hash: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for path in paths {
            match calculate_file_hash(&path) {
                Ok(hash) => by_hash.entry(hash).or_default().push(path),
                Err(e) => warn!("Cannot hash {:?}: {}", path, e),
            }
        }
        for (hash, mut paths) in by_hash.into_iter().filter(|(_, p)| p.len() > 1) {
            paths.sort();
            groups.push(DuplicateGroup { hash, size, paths });
        }
    }

    groups.sort_by(|a, b| a.paths.cmp(&b.paths));
    debug!("Found {} duplicate group(s) under {:?}", groups.len(), dir);
    Ok(groups)
}
