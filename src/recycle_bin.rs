// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Application recycle bin: removed files are parked here so a clean run can be undone

use chrono::Local;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::executor::{move_file_to, move_file_unique_as};
use crate::Result;

#[derive(Debug, Clone)]
pub struct RecycleBin {
    dir: PathBuf,
}

impl RecycleBin {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move `path` into the bin under a timestamped name and return that location
    pub fn safe_delete(&self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        fs::create_dir_all(&self.dir)?;

        let mut backup_name = OsString::from(Local::now().format("%Y%m%d_%H%M%S_%f_").to_string());
        backup_name.push(name);
        let backup = move_file_unique_as(path, &self.dir, &backup_name)?;

        info!("Moved {:?} to recycle bin as {:?}", path, backup);
        Ok(backup)
    }

    /// Put a backup back at its original path, recreating parent directories.
    /// Returns where the file actually landed.
    pub fn restore(&self, backup: &Path, original: &Path) -> Result<PathBuf> {
        if !backup.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("backup not found: {:?}", backup),
            )
            .into());
        }
        let landed = move_file_to(backup, original)?;
        info!("Restored {:?} to {:?}", backup, landed);
        Ok(landed)
    }
}
