// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! File system watcher for the organized directory

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::Result;

/// Events emitted by the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A new file was created
    FileCreated(PathBuf),
    /// Watcher error
    Error(String),
    /// The notify backend went away
    Disconnected,
}

/// Non-recursive watcher over a single directory
pub struct FileWatcher {
    // Dropping the watcher unsubscribes
    _watcher: RecommendedWatcher,
    dir: PathBuf,
    event_rx: Receiver<notify::Result<Event>>,
}

impl FileWatcher {
    pub fn new(dir: &Path) -> Result<Self> {
        let (tx, rx) = channel();

        let config = Config::default().with_poll_interval(Duration::from_secs(2));
        let mut watcher = RecommendedWatcher::new(tx, config)?;

        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            info!("Created watch directory: {:?}", dir);
        }
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("Watching: {:?}", dir);

        Ok(Self {
            _watcher: watcher,
            dir: dir.to_path_buf(),
            event_rx: rx,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the next event (blocking with timeout)
    pub fn next_event(&self, timeout: Duration) -> Option<WatchEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(Ok(event)) => Self::convert_event(event),
            Ok(Err(e)) => Some(WatchEvent::Error(e.to_string())),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(WatchEvent::Disconnected),
        }
    }

    fn convert_event(event: Event) -> Option<WatchEvent> {
        match event.kind {
            EventKind::Create(_) => event.paths.first().map(|p| WatchEvent::FileCreated(p.clone())),
            _ => None,
        }
    }
}

/// Collapses repeated events for one path inside a time window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    seen: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True if `path` should trigger now; false if it fired within the window
    pub fn accept(&mut self, path: &Path, now: Instant) -> bool {
        match self.seen.get(path) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.seen.insert(path.to_path_buf(), now);
                true
            }
        }
    }

    /// Forget paths whose window has passed
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Running watcher thread. Stopping (or dropping) it unsubscribes and joins.
pub struct WatchHandle {
    dir: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Request stop and wait for the thread; returns within one poll interval
    /// unless a forward is in flight.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Watcher thread for {:?} panicked", self.dir);
            }
            info!("Stopped watching: {:?}", self.dir);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Watch `dir` on a dedicated thread, forwarding debounced creations to `tx`
pub fn spawn_watcher(
    dir: &Path,
    config: &WatcherConfig,
    tx: UnboundedSender<PathBuf>,
) -> Result<WatchHandle> {
    let watcher = FileWatcher::new(dir)?;
    let stop = Arc::new(AtomicBool::new(false));
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));
    let window = Duration::from_millis(config.debounce_ms);

    let thread_stop = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name("tidydesk-watcher".to_string())
        .spawn(move || watch_loop(watcher, thread_stop, poll, Debouncer::new(window), tx))?;

    Ok(WatchHandle {
        dir: dir.to_path_buf(),
        stop,
        thread: Some(thread),
    })
}

fn watch_loop(
    watcher: FileWatcher,
    stop: Arc<AtomicBool>,
    poll: Duration,
    mut debouncer: Debouncer,
    tx: UnboundedSender<PathBuf>,
) {
    while !stop.load(Ordering::SeqCst) {
        match watcher.next_event(poll) {
            Some(WatchEvent::FileCreated(path)) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if !should_process(&path) {
                    debug!("Ignoring {:?}", path);
                    continue;
                }
                if !debouncer.accept(&path, Instant::now()) {
                    debug!("Debounced duplicate event for {:?}", path);
                    continue;
                }
                if tx.send(path).is_err() {
                    debug!("Watch receiver dropped, stopping");
                    break;
                }
            }
            Some(WatchEvent::Error(e)) => warn!("Watch error on {:?}: {}", watcher.dir(), e),
            Some(WatchEvent::Disconnected) => {
                error!("Watcher disconnected for {:?}", watcher.dir());
                break;
            }
            None => {}
        }
        debouncer.prune(Instant::now());
    }
}

/// Check if a file should be processed
pub fn should_process(path: &Path) -> bool {
    let filename = match path.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return false,
    };

    if filename.starts_with('.') {
        return false;
    }

    // In-progress downloads
    let temp_extensions = [".tmp", ".part", ".crdownload", ".partial", ".download"];
    if temp_extensions.iter().any(|ext| filename.ends_with(ext)) {
        return false;
    }

    let skip_names = ["desktop.ini", "thumbs.db", ".ds_store"];
    !skip_names.iter().any(|n| filename.eq_ignore_ascii_case(n))
}

/// Wait for a file to stop growing. Returns false if it disappeared.
pub async fn wait_for_stable(path: &Path, settle: Duration, max_wait: Duration) -> bool {
    let check_interval = settle.max(Duration::from_millis(10));
    let start = Instant::now();

    let mut last_size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return false,
    };

    loop {
        tokio::time::sleep(check_interval).await;

        let current_size = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => return false,
        };

        if current_size == last_size {
            return true;
        }

        if start.elapsed() > max_wait {
            warn!("File stability check timed out for {:?}", path);
            return true;
        }

        last_size = current_size;
        debug!("File {:?} still being written, size: {}", path, current_size);
    }
}
