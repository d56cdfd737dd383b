// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tidydesk: rule-driven desktop organizer core
//!
//! Classifies files appearing in a watched directory against ordered rules,
//! moves them into folders or references them from boxes, and keeps an
//! undoable history of every batch it applies. Presentation is left to the
//! host, which drives a [`DeskEngine`] and listens to its events.

pub mod boxes;
pub mod config;
pub mod duplicates;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod logging;
pub mod organizer;
pub mod pool;
pub mod recycle_bin;
pub mod rules;
pub mod watcher;

pub use config::AppConfig;
pub use engine::DeskEngine;
pub use error::{Result, TidydeskError};
