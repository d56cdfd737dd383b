// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Ordered routing rules and the classifier that evaluates them

pub mod condition;

pub use condition::{Condition, Field, FileMeta, Operator};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::AppConfig;

/// What to do with a file once a rule matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Reference the file from a box's shortcut directory
    AssignToBox { box_id: String },
    /// Move the file into a directory (relative paths resolve against the file's parent)
    MoveTo { path: PathBuf },
    /// Action that could not be understood; the owning rule never matches
    #[serde(other)]
    Unsupported,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::AssignToBox { .. } => "assign_to_box",
            Action::MoveTo { .. } => "move_to",
            Action::Unsupported => "unsupported",
        }
    }
}

/// An ordered, AND-combined set of conditions mapped to one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value", into = "RawRule")]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub action: Action,
}

/// Canonical on-disk shape written back by `save`
#[derive(Debug, Clone, Serialize)]
struct RawRule {
    name: String,
    enabled: bool,
    conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<Value>,
}

/// Parses leniently: a rule with unusable parts loads but never matches, so
/// one bad entry cannot take the rest of the rule list down with it.
impl From<Value> for Rule {
    fn from(raw: Value) -> Self {
        let Value::Object(map) = raw else {
            warn!("Ignoring malformed rule: {}", raw);
            return Self {
                name: String::new(),
                enabled: false,
                conditions: Vec::new(),
                action: Action::Unsupported,
            };
        };

        let name = map
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let enabled = match map.get("enabled") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(enabled)) => *enabled,
            Some(other) => {
                warn!("Rule '{}' has a non-boolean enabled flag {}, disabling it", name, other);
                false
            }
        };

        let conditions = match map.get("conditions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().cloned().map(Condition::from).collect(),
            Some(other) => {
                warn!("Rule '{}' has malformed conditions: {}", name, other);
                Vec::new()
            }
        };

        // Older configs name the destination box directly on the rule
        let action = match (map.get("action"), map.get("target_box")) {
            (Some(value), _) if !value.is_null() => serde_json::from_value(value.clone())
                .unwrap_or_else(|e| {
                    warn!("Rule '{}' has a malformed action: {}", name, e);
                    Action::Unsupported
                }),
            (_, Some(Value::String(box_id))) if !box_id.is_empty() => Action::AssignToBox {
                box_id: box_id.clone(),
            },
            _ => Action::Unsupported,
        };

        Self {
            name,
            enabled,
            conditions,
            action,
        }
    }
}

impl From<Rule> for RawRule {
    fn from(rule: Rule) -> Self {
        Self {
            name: rule.name,
            enabled: rule.enabled,
            conditions: rule.conditions,
            action: serde_json::to_value(&rule.action).ok(),
        }
    }
}

impl Rule {
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>, action: Action) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            conditions,
            action,
        }
    }

    /// True when the rule is usable and every condition holds
    pub fn matches(&self, meta: &FileMeta) -> bool {
        self.enabled
            && !self.conditions.is_empty()
            && self.action != Action::Unsupported
            && self.conditions.iter().all(|c| c.matches(meta))
    }
}

/// Pure evaluator over a rule list and an exceptions set
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<Rule>,
    exceptions: HashSet<String>,
}

impl Classifier {
    pub fn new<I, S>(rules: Vec<Rule>, exceptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rules,
            exceptions: exceptions
                .into_iter()
                .map(|e| e.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.advanced_rules.clone(), &config.exceptions)
    }

    /// Replace rules and exceptions with those of a new snapshot
    pub fn update_config(&mut self, config: &AppConfig) {
        *self = Self::from_config(config);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_exception(&self, file_name: &str) -> bool {
        self.exceptions.contains(&file_name.to_lowercase())
    }

    /// First enabled rule, in list order, whose conditions all hold
    pub fn matching_rule(&self, meta: &FileMeta) -> Option<&Rule> {
        if meta.is_dir {
            return None;
        }

        if self.is_exception(&meta.full_name) {
            debug!("Skipping exception: {}", meta.full_name);
            return None;
        }

        self.rules.iter().find(|rule| rule.matches(meta))
    }

    /// Action of the first matching rule, if any
    pub fn classify(&self, meta: &FileMeta) -> Option<&Action> {
        self.matching_rule(meta).map(|rule| &rule.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ext_rule(name: &str, ext: &str, action: Action) -> Rule {
        Rule::new(name, vec![Condition::new(Field::Extension, Operator::Is, ext)], action)
    }

    fn boxed(id: &str) -> Action {
        Action::AssignToBox { box_id: id.to_string() }
    }

    fn meta(name: &str) -> FileMeta {
        FileMeta::from_name(Path::new(name))
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            Rule::new(
                "screens",
                vec![Condition::new(Field::FullName, Operator::Contains, "Screenshot")],
                boxed("boxA"),
            ),
            ext_rule("pngs", ".png", boxed("boxB")),
        ];
        let classifier = Classifier::new(rules, Vec::<String>::new());

        assert_eq!(classifier.classify(&meta("Screenshot_01.png")), Some(&boxed("boxA")));
        assert_eq!(classifier.classify(&meta("photo.png")), Some(&boxed("boxB")));
        assert_eq!(classifier.classify(&meta("notes.txt")), None);
    }

    #[test]
    fn test_rule_order_changes_result() {
        let a = Rule::new(
            "screens",
            vec![Condition::new(Field::FullName, Operator::Contains, "screenshot")],
            boxed("boxA"),
        );
        let b = ext_rule("pngs", "png", boxed("boxB"));

        let forward = Classifier::new(vec![a.clone(), b.clone()], Vec::<String>::new());
        let reversed = Classifier::new(vec![b, a], Vec::<String>::new());

        let m = meta("Screenshot_01.png");
        assert_eq!(forward.classify(&m), Some(&boxed("boxA")));
        assert_eq!(reversed.classify(&m), Some(&boxed("boxB")));
    }

    #[test]
    fn test_conditions_are_and_combined() {
        let rule = Rule::new(
            "big screenshot pngs",
            vec![
                Condition::new(Field::Extension, Operator::Is, "png"),
                Condition::new(Field::Name, Operator::StartsWith, "screenshot"),
            ],
            boxed("shots"),
        );
        let classifier = Classifier::new(vec![rule], Vec::<String>::new());

        assert!(classifier.classify(&meta("Screenshot 2024.png")).is_some());
        assert!(classifier.classify(&meta("Screenshot 2024.jpg")).is_none());
        assert!(classifier.classify(&meta("photo.png")).is_none());
    }

    #[test]
    fn test_exceptions_take_precedence() {
        let classifier = Classifier::new(
            vec![ext_rule("pngs", "png", boxed("boxB"))],
            vec!["Keep-Me.png"],
        );

        assert!(classifier.classify(&meta("keep-me.png")).is_none());
        assert!(classifier.classify(&meta("other.png")).is_some());
    }

    #[test]
    fn test_disabled_and_empty_rules_skipped() {
        let mut disabled = ext_rule("off", "png", boxed("off"));
        disabled.enabled = false;
        let empty = Rule::new("empty", vec![], boxed("empty"));
        let unsupported = ext_rule("broken", "png", Action::Unsupported);
        let live = ext_rule("on", "png", boxed("on"));

        let classifier =
            Classifier::new(vec![disabled, empty, unsupported, live], Vec::<String>::new());
        assert_eq!(classifier.classify(&meta("a.png")), Some(&boxed("on")));
    }

    #[test]
    fn test_directories_never_classified() {
        let classifier =
            Classifier::new(vec![ext_rule("pngs", "png", boxed("b"))], Vec::<String>::new());
        let mut m = meta("folder.png");
        m.is_dir = true;
        assert!(classifier.classify(&m).is_none());
    }

    #[test]
    fn test_rule_json_round_trip_preserves_order() {
        let json = r#"[
            {"name": "first", "conditions": [{"field": "extension", "operator": "is", "value": "png"}],
             "action": {"type": "move_to", "path": "Images"}},
            {"name": "second", "enabled": false, "target_box": "legacy",
             "conditions": [{"type": "name_contains", "value": "x"}]},
            {"name": "third", "conditions": [{"field": "name", "operator": "is", "value": "y"}],
             "action": {"type": "teleport"}}
        ]"#;
        let rules: Vec<Rule> = serde_json::from_str(json).unwrap();

        assert_eq!(rules[0].action, Action::MoveTo { path: PathBuf::from("Images") });
        assert!(rules[0].enabled);
        assert_eq!(rules[1].action, boxed("legacy"));
        assert!(!rules[1].enabled);
        assert_eq!(rules[2].action, Action::Unsupported);

        let again: Vec<Rule> =
            serde_json::from_str(&serde_json::to_string(&rules).unwrap()).unwrap();
        let names: Vec<_> = again.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert_eq!(again, rules);
    }

    #[test]
    fn test_good_rule_after_malformed_one_still_routes() {
        let json = r#"[
            {"name": "numeric", "conditions": [{"field": "extension", "operator": "is", "value": 5}],
             "action": {"type": "move_to", "path": "Numbers"}},
            {"name": "odd field", "conditions": [{"field": ["name"], "operator": "is", "value": "a"}],
             "action": {"type": "move_to", "path": "Odd"}},
            {"name": "odd flag", "enabled": "yes",
             "conditions": [{"field": "extension", "operator": "is", "value": "png"}],
             "action": {"type": "move_to", "path": "Flagged"}},
            "not a rule",
            {"name": "pngs", "conditions": [{"field": "extension", "operator": "is", "value": "png"}],
             "action": {"type": "move_to", "path": "Images"}}
        ]"#;
        let rules: Vec<Rule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules.len(), 5);
        assert!(!rules[2].enabled);

        let classifier = Classifier::new(rules, Vec::<String>::new());
        assert_eq!(
            classifier.classify(&meta("a.png")),
            Some(&Action::MoveTo { path: PathBuf::from("Images") })
        );
        assert_eq!(classifier.matching_rule(&meta("a.5")), None);
    }

    #[test]
    fn test_malformed_action_tolerated() {
        let json = r#"{"name": "bad", "conditions": [], "action": {"type": "assign_to_box"}}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.action, Action::Unsupported);
    }
}
