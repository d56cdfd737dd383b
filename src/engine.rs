// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Host-facing entry point.
//!
//! `DeskEngine` owns the organizer, the undo history, the worker pool and at
//! most one directory watcher. Every filesystem-touching call runs on the
//! worker pool, so a host can drive it from its interactive thread and listen
//! for results on [`DeskEngine::subscribe`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::boxes::BoxRegistry;
use crate::config::{CleanOptions, SortOptions};
use crate::duplicates::{find_duplicates, DuplicateGroup};
use crate::events::{EventSender, OrganizerEvent};
use crate::history::{UndoManager, UndoOutcome};
use crate::organizer::{Organizer, RunSummary};
use crate::pool::WorkerPool;
use crate::watcher::{spawn_watcher, wait_for_stable, WatchHandle};
use crate::{AppConfig, Result, TidydeskError};

struct ActiveWatch {
    handle: WatchHandle,
    forwarder: JoinHandle<()>,
}

pub struct DeskEngine {
    organizer: Arc<Organizer>,
    undo: Arc<UndoManager>,
    pool: WorkerPool,
    events: EventSender,
    watch: Mutex<Option<ActiveWatch>>,
}

impl DeskEngine {
    /// Build an engine from a configuration, opening the undo history it names
    pub fn new(config: AppConfig) -> Result<Self> {
        let undo = Arc::new(UndoManager::from_config(&config)?);
        let events = EventSender::new();
        let pool = WorkerPool::new(config.workers.max_workers);
        let organizer = Organizer::new(Arc::new(config), Arc::clone(&undo), events.clone());
        Ok(Self::assemble(organizer, undo, pool, events))
    }

    /// Like [`DeskEngine::new`], resolving boxes through the host's registry
    pub fn with_registry(config: AppConfig, registry: Arc<dyn BoxRegistry>) -> Result<Self> {
        let undo = Arc::new(UndoManager::from_config(&config)?);
        let events = EventSender::new();
        let pool = WorkerPool::new(config.workers.max_workers);
        let organizer =
            Organizer::with_registry(Arc::new(config), registry, Arc::clone(&undo), events.clone());
        Ok(Self::assemble(organizer, undo, pool, events))
    }

    fn assemble(organizer: Organizer, undo: Arc<UndoManager>, pool: WorkerPool, events: EventSender) -> Self {
        Self {
            organizer: Arc::new(organizer),
            undo,
            pool,
            events,
            watch: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrganizerEvent> {
        self.events.subscribe()
    }

    pub fn organizer(&self) -> &Arc<Organizer> {
        &self.organizer
    }

    pub fn undo_manager(&self) -> &Arc<UndoManager> {
        &self.undo
    }

    pub fn config(&self) -> Result<Arc<AppConfig>> {
        self.organizer.config()
    }

    /// Swap the rule set, boxes and options. History size and the running
    /// watcher keep the values they were created with.
    pub fn update_config(&self, config: AppConfig) -> Result<()> {
        self.organizer.update_config(Arc::new(config))
    }

    pub async fn organize(&self, dir: impl Into<PathBuf>) -> Result<RunSummary> {
        let dir = dir.into();
        let organizer = Arc::clone(&self.organizer);
        self.pool.run(move || organizer.organize_directory(&dir)).await?
    }

    pub async fn sort(&self, dir: impl Into<PathBuf>, options: SortOptions) -> Result<RunSummary> {
        let dir = dir.into();
        let organizer = Arc::clone(&self.organizer);
        self.pool.run(move || organizer.sort_directory(&dir, &options)).await?
    }

    pub async fn clean(&self, dir: impl Into<PathBuf>, options: CleanOptions) -> Result<RunSummary> {
        let dir = dir.into();
        let organizer = Arc::clone(&self.organizer);
        self.pool.run(move || organizer.clean_directory(&dir, &options)).await?
    }

    /// Undo the latest batch. A running watcher does not re-organize what it restores.
    pub async fn undo(&self) -> Result<UndoOutcome> {
        let organizer = Arc::clone(&self.organizer);
        self.pool.run(move || organizer.undo_last()).await
    }

    pub async fn find_duplicates(&self, dir: impl Into<PathBuf>) -> Result<Vec<DuplicateGroup>> {
        let dir = dir.into();
        self.pool.run(move || find_duplicates(&dir)).await?
    }

    fn lock_watch(&self) -> Result<MutexGuard<'_, Option<ActiveWatch>>> {
        self.watch
            .lock()
            .map_err(|_| TidydeskError::Config("Watcher state lock poisoned".to_string()))
    }

    /// Watch `dir` and auto-organize new files. Replaces any previous watch.
    /// Must be called from within a tokio runtime.
    pub fn start_watching(&self, dir: &Path) -> Result<()> {
        let config = self.organizer.config()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_watcher(dir, &config.watcher, tx)?;

        let forwarder = tokio::spawn(forward_new_files(
            rx,
            Arc::clone(&self.organizer),
            self.pool.clone(),
            Duration::from_millis(config.watcher.settle_ms),
            Duration::from_millis(config.watcher.max_settle_ms),
        ));

        let previous = self.lock_watch()?.replace(ActiveWatch { handle, forwarder });
        if let Some(previous) = previous {
            info!("Replacing watch on {:?} with {:?}", previous.handle.dir(), dir);
            previous.handle.stop();
        }
        Ok(())
    }

    /// Stop the watcher. Files already handed to the pool still finish.
    /// Returns false if nothing was being watched.
    pub async fn stop_watching(&self) -> Result<bool> {
        let active = self.lock_watch()?.take();
        let Some(active) = active else {
            return Ok(false);
        };
        let ActiveWatch { handle, forwarder } = active;
        tokio::task::spawn_blocking(move || handle.stop())
            .await
            .map_err(|e| TidydeskError::Pool(format!("watcher shutdown failed: {}", e)))?;
        if let Err(e) = forwarder.await {
            warn!("Watch forwarder ended abnormally: {}", e);
        }
        Ok(true)
    }

    pub fn watched_dir(&self) -> Option<PathBuf> {
        self.lock_watch()
            .ok()
            .and_then(|w| w.as_ref().map(|a| a.handle.dir().to_path_buf()))
    }
}

/// Drain watcher output: let each file settle, then organize it on the pool
async fn forward_new_files(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    organizer: Arc<Organizer>,
    pool: WorkerPool,
    settle: Duration,
    max_settle: Duration,
) {
    while let Some(path) = rx.recv().await {
        let organizer = Arc::clone(&organizer);
        let pool = pool.clone();
        tokio::spawn(async move {
            if !wait_for_stable(&path, settle, max_settle).await {
                debug!("File disappeared during stability check: {:?}", path);
                return;
            }
            let target = path.clone();
            match pool.run(move || organizer.handle_new_file(&target)).await {
                Ok(Ok(Some(record))) => info!("Auto-organized {:?} -> {:?}", path, record.new_path),
                Ok(Ok(None)) => debug!("No rule for {:?}", path),
                Ok(Err(e)) => warn!("Failed to organize {:?}: {}", path, e),
                Err(e) => error!("Worker failed for {:?}: {}", path, e),
            }
        });
    }
    debug!("Watch channel closed");
}
