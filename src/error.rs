// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for tidydesk

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tidydesk operations
pub type Result<T> = std::result::Result<T, TidydeskError>;

/// tidydesk error types
#[derive(Error, Debug)]
pub enum TidydeskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The directory a run was asked to process cannot be listed.
    #[error("Directory unavailable: {path:?}: {source}")]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown box: {0}")]
    UnknownBox(String),

    #[error("A run is already in progress for {0:?}")]
    RunInProgress(PathBuf),

    #[error("Undo history is empty")]
    HistoryEmpty,

    /// Part of a batch was reversed before an error stopped the undo.
    #[error("Undo incomplete after restoring {restored} file(s): {reason}")]
    UndoIncomplete { restored: usize, reason: String },

    /// A box assignment failed and moving the original back failed too.
    #[error("Rollback failed for {path:?} (left at {stranded:?}): {reason}")]
    Rollback {
        path: PathBuf,
        stranded: PathBuf,
        reason: String,
    },

    #[error("Worker pool error: {0}")]
    Pool(String),
}
