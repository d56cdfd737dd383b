// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Rule conditions and the file metadata they are evaluated against

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::Result;

/// File attribute a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Extension without the leading dot
    Extension,
    /// File stem (name without extension)
    Name,
    /// Full file name including extension
    FullName,
    /// Creation date as local `YYYY-MM-DD`
    DateCreated,
    /// Modification date as local `YYYY-MM-DD`
    DateModified,
    #[serde(other)]
    Unknown,
}

/// Comparison applied between the field and the condition value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Is,
    IsNot,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    /// Value is a comma-separated set
    In,
    #[serde(other)]
    Unknown,
}

/// A single predicate over file metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value", into = "RawCondition")]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    pub value: String,
}

/// Canonical on-disk shape written back by `save`
#[derive(Debug, Clone, Serialize)]
struct RawCondition {
    field: Field,
    operator: Operator,
    value: String,
}

/// Accepts both `{field, operator, value}` and the older
/// `{type: "extension_is" | "name_contains", value}` form. Input that cannot
/// be understood becomes an `Unknown` condition so the rest of the config
/// still loads.
impl From<Value> for Condition {
    fn from(raw: Value) -> Self {
        let Value::Object(map) = raw else {
            warn!("Ignoring malformed condition: {}", raw);
            return Self::unusable();
        };

        let value = match map.get("value") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                warn!("Condition value is not a string: {}", other);
                return Self::unusable();
            }
        };

        let field = map.get("field");
        let operator = map.get("operator");
        let (field, operator) = if field.is_some() || operator.is_some() {
            (
                parse_tag(field, Field::Unknown),
                parse_tag(operator, Operator::Unknown),
            )
        } else {
            match map.get("type").and_then(Value::as_str) {
                Some("extension_is") => (Field::Extension, Operator::Is),
                Some("name_contains") => (Field::FullName, Operator::Contains),
                _ => (Field::Unknown, Operator::Unknown),
            }
        };

        Self {
            field,
            operator,
            value,
        }
    }
}

fn parse_tag<T: DeserializeOwned>(raw: Option<&Value>, unknown: T) -> T {
    match raw {
        Some(Value::String(tag)) => {
            serde_json::from_value(Value::String(tag.clone())).unwrap_or(unknown)
        }
        Some(other) => {
            warn!("Condition tag is not a string: {}", other);
            unknown
        }
        None => unknown,
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        Self {
            field: condition.field,
            operator: condition.operator,
            value: condition.value,
        }
    }
}

impl Condition {
    pub fn new(field: Field, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
        }
    }

    fn unusable() -> Self {
        Self::new(Field::Unknown, Operator::Unknown, "")
    }

    /// Evaluate this condition. Unknown fields or operators never match.
    pub fn matches(&self, meta: &FileMeta) -> bool {
        let Some(subject) = meta.field_value(self.field) else {
            return false;
        };

        match self.operator {
            Operator::In => self
                .value
                .split(',')
                .map(|item| normalize(self.field, item))
                .filter(|item| !item.is_empty())
                .any(|item| item == subject),
            Operator::Unknown => false,
            op => {
                let value = normalize(self.field, &self.value);
                match op {
                    Operator::Is => subject == value,
                    Operator::IsNot => subject != value,
                    // An empty needle would match every file
                    Operator::Contains => !value.is_empty() && subject.contains(&value),
                    Operator::NotContains => value.is_empty() || !subject.contains(&value),
                    Operator::StartsWith => !value.is_empty() && subject.starts_with(&value),
                    Operator::EndsWith => !value.is_empty() && subject.ends_with(&value),
                    Operator::In | Operator::Unknown => false,
                }
            }
        }
    }
}

fn normalize(field: Field, value: &str) -> String {
    let value = value.trim().to_lowercase();
    match field {
        Field::Extension => value.trim_start_matches('.').to_string(),
        _ => value,
    }
}

/// Metadata derived from a file path, the input to classification
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: PathBuf,
    pub full_name: String,
    pub stem: String,
    /// Lowercase, without the leading dot
    pub extension: String,
    pub created: Option<DateTime<Local>>,
    pub modified: Option<DateTime<Local>>,
    pub is_dir: bool,
}

impl FileMeta {
    /// Build metadata from the path alone, without touching the filesystem
    pub fn from_name(path: &Path) -> Self {
        let full_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Self {
            path: path.to_path_buf(),
            full_name,
            stem,
            extension,
            created: None,
            modified: None,
            is_dir: false,
        }
    }

    /// Build metadata from the path and its filesystem attributes
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mut meta = Self::from_name(path);
        meta.is_dir = metadata.is_dir();
        // Creation time is not available on every platform
        meta.created = metadata.created().ok().map(DateTime::<Local>::from);
        meta.modified = metadata.modified().ok().map(DateTime::<Local>::from);
        Ok(meta)
    }

    fn field_value(&self, field: Field) -> Option<String> {
        match field {
            Field::Extension => Some(self.extension.clone()),
            Field::Name => Some(self.stem.to_lowercase()),
            Field::FullName => Some(self.full_name.to_lowercase()),
            Field::DateCreated => self.created.map(|d| d.format("%Y-%m-%d").to_string()),
            Field::DateModified => self.modified.map(|d| d.format("%Y-%m-%d").to_string()),
            Field::Unknown => None,
        }
    }
}
