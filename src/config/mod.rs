// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for tidydesk

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::boxes::BoxDef;
use crate::rules::{Action, Rule};

/// Main application configuration. The core only ever sees an immutable
/// snapshot of this; the host persists edits and then calls `update_config`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Category folder name -> extensions. Folders with these names are
    /// never reclassified.
    #[serde(default = "default_categories")]
    pub categories: BTreeMap<String, Vec<String>>,

    /// File names exempt from classification
    #[serde(default)]
    pub exceptions: Vec<String>,

    /// Ordered routing rules
    #[serde(default)]
    pub advanced_rules: Vec<Rule>,

    /// Boxes rules can assign files to
    #[serde(default)]
    pub desktop_boxes: Vec<BoxDef>,

    /// Whether watcher events are organized automatically
    #[serde(default = "default_true")]
    pub auto_organize_enabled: bool,

    #[serde(default)]
    pub clean_options: CleanOptions,

    #[serde(default)]
    pub sort_options: SortOptions,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CleanOptions {
    #[serde(default = "default_true")]
    pub remove_broken_shortcuts: bool,
    #[serde(default = "default_true")]
    pub remove_temp_files: bool,
    /// Glob patterns matched against file names, e.g. `*.log`
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SortOptions {
    #[serde(default = "default_true")]
    pub by_type: bool,
    #[serde(default)]
    pub by_date: bool,
    #[serde(default)]
    pub by_size: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Root for everything tidydesk writes outside the watched directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Move box-assigned originals into hidden storage instead of only hiding them
    #[serde(default = "default_true")]
    pub relocate_assigned: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    /// History log path; relative paths resolve against `storage.data_dir`
    #[serde(default = "default_history_file")]
    pub file: String,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    /// Events for one path inside this window collapse into one
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Grace period before a new file is handled
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Upper bound on waiting for a file that keeps growing
    #[serde(default = "default_max_settle_ms")]
    pub max_settle_ms: u64,
    /// Stop requests are noticed within this interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

// Default value functions
fn default_true() -> bool { true }
fn default_data_dir() -> String { "tidydesk_data".to_string() }
fn default_history_file() -> String { "undo_history.jsonl".to_string() }
fn default_max_entries() -> usize { 10 }
fn default_debounce_ms() -> u64 { 1000 }
fn default_settle_ms() -> u64 { 500 }
fn default_max_settle_ms() -> u64 { 10_000 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_max_workers() -> usize { 4 }

fn default_categories() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 6] = [
        ("Programs", &[".exe", ".lnk", ".msi", ".bat", ".desktop"]),
        ("Documents", &[".doc", ".docx", ".pdf", ".xls", ".xlsx", ".ppt", ".pptx", ".txt"]),
        ("Images", &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg"]),
        ("Media", &[".mp3", ".mp4", ".avi", ".mkv", ".mov", ".wav"]),
        ("Archives", &[".zip", ".rar", ".7z", ".tar", ".gz"]),
        ("Code", &[".py", ".js", ".html", ".css", ".java", ".cpp", ".cs", ".rs"]),
    ];
    table
        .iter()
        .map(|(name, exts)| (name.to_string(), exts.iter().map(|e| e.to_string()).collect()))
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            exceptions: Vec::new(),
            advanced_rules: Vec::new(),
            desktop_boxes: Vec::new(),
            auto_organize_enabled: true,
            clean_options: CleanOptions::default(),
            sort_options: SortOptions::default(),
            storage: StorageConfig::default(),
            history: HistoryConfig::default(),
            watcher: WatcherConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            remove_broken_shortcuts: true,
            remove_temp_files: true,
            patterns: Vec::new(),
        }
    }
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            by_type: true,
            by_date: false,
            by_size: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relocate_assigned: true,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file: default_history_file(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            settle_ms: default_settle_ms(),
            max_settle_ms: default_max_settle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Per-box shortcut directories live here
    pub fn boxes_dir(&self) -> PathBuf {
        self.data_dir().join("boxes")
    }

    /// Box-assigned originals are relocated here
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir().join("storage")
    }

    /// Files removed by a clean run are kept here until undone
    pub fn recycle_bin_dir(&self) -> PathBuf {
        self.data_dir().join("recycle_bin")
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::TidydeskError::Config(format!("Failed to parse config: {}", e)))?;
            config.warn_on_dangling_boxes();
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Absolute or data-dir-relative location of the undo history log
    pub fn history_path(&self) -> PathBuf {
        let file = PathBuf::from(&self.history.file);
        if file.is_absolute() {
            file
        } else {
            self.storage.data_dir().join(file)
        }
    }

    /// Lowercased names of category and box folders that a run must not touch
    pub fn reserved_folder_names(&self) -> HashSet<String> {
        self.categories
            .keys()
            .map(|name| name.to_lowercase())
            .chain(
                self.desktop_boxes
                    .iter()
                    .flat_map(|b| [b.id.to_lowercase(), b.name.to_lowercase()]),
            )
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn warn_on_dangling_boxes(&self) {
        for rule in &self.advanced_rules {
            if let Action::AssignToBox { box_id } = &rule.action {
                if !self.desktop_boxes.iter().any(|b| &b.id == box_id || &b.name == box_id) {
                    tracing::warn!("Rule '{}' targets unknown box '{}'", rule.name, box_id);
                }
            }
        }
    }
}
