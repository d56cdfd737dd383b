// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Box registry: named destination containers that rules reference by id

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A box as persisted in the configuration. Position, size and appearance
/// belong to the host UI and are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: [i32; 2],
    #[serde(default = "default_size")]
    pub size: [u32; 2],
    #[serde(default)]
    pub appearance: serde_json::Value,
}

fn default_size() -> [u32; 2] {
    [250, 300]
}

impl BoxDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position: [100, 100],
            size: default_size(),
            appearance: serde_json::Value::Null,
        }
    }
}

/// What the organizing core needs to know about boxes
pub trait BoxRegistry: Send + Sync {
    fn box_exists(&self, box_id: &str) -> bool;

    /// Directory holding the shortcuts of a box, `None` for unknown ids
    fn resolve_shortcut_dir(&self, box_id: &str) -> Option<PathBuf>;

    /// Id of the box a rule refers to. Registries that also accept other
    /// references (display names) map them to the id here.
    fn canonical_id(&self, box_ref: &str) -> Option<String> {
        self.box_exists(box_ref).then(|| box_ref.to_string())
    }
}

/// Registry backed by the `desktop_boxes` configuration list.
/// Each box stores its shortcuts under `<root>/<box id>`. Older rules name
/// the box by its display name; an id match always wins over a name match.
#[derive(Debug, Clone)]
pub struct ConfigBoxRegistry {
    root: PathBuf,
    boxes: HashMap<String, BoxDef>,
    names: HashMap<String, String>,
}

impl ConfigBoxRegistry {
    pub fn new(root: impl Into<PathBuf>, boxes: &[BoxDef]) -> Self {
        let mut names = HashMap::new();
        for b in boxes.iter().filter(|b| !b.name.is_empty()) {
            // first box with a given name keeps it
            names.entry(b.name.clone()).or_insert_with(|| b.id.clone());
        }
        Self {
            root: root.into(),
            boxes: boxes.iter().map(|b| (b.id.clone(), b.clone())).collect(),
            names,
        }
    }

    fn lookup(&self, box_ref: &str) -> Option<&BoxDef> {
        self.boxes
            .get(box_ref)
            .or_else(|| self.names.get(box_ref).and_then(|id| self.boxes.get(id)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Box by id, or by display name when no id matches
    pub fn get(&self, box_ref: &str) -> Option<&BoxDef> {
        self.lookup(box_ref)
    }
}

impl BoxRegistry for ConfigBoxRegistry {
    fn box_exists(&self, box_ref: &str) -> bool {
        self.lookup(box_ref).is_some()
    }

    fn resolve_shortcut_dir(&self, box_ref: &str) -> Option<PathBuf> {
        self.lookup(box_ref)
            .map(|b| self.root.join(sanitize_dir_name(&b.id)))
    }

    fn canonical_id(&self, box_ref: &str) -> Option<String> {
        self.lookup(box_ref).map(|b| b.id.clone())
    }
}

/// Keep box ids usable as a single path component
fn sanitize_dir_name(id: &str) -> String {
    let clean: String = id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '\0') { '_' } else { c })
        .collect();
    match clean.trim() {
        "" | "." | ".." => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}
