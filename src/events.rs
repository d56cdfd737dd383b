// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Events the core emits to its host

use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::history::BatchOperation;

/// Capacity of the event channel; slow subscribers see `Lagged` past this
pub const EVENT_CAPACITY: usize = 256;

/// Phase of an organize/sort/clean run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Scanning,
    Processing,
    Aggregating,
    Completed,
    Failed,
}

/// Events emitted by the organizer
#[derive(Debug, Clone)]
pub enum OrganizerEvent {
    /// A run moved to a new phase
    Phase { dir: PathBuf, phase: RunPhase },
    /// Percentage of entries processed, 0..=100, non-decreasing within a run
    Progress(u8),
    /// Terminal message of a run, success or failure
    RunCompleted(String),
    /// A batch was handed to the undo history
    OperationLogged(BatchOperation),
    /// A file was referenced from a box
    ShortcutAssigned { box_id: String, shortcut_path: PathBuf },
}

/// Cloneable sending half; emitting with no subscribers is not an error
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<OrganizerEvent>,
}

impl EventSender {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrganizerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: OrganizerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain whatever is currently buffered on a receiver
pub fn drain(rx: &mut broadcast::Receiver<OrganizerEvent>) -> Vec<OrganizerEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
