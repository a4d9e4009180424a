//! Hot reload: filesystem watches that trigger [`ModuleRegistry::reload`].
//!
//! A `notify` watcher forwards relevant events to a worker thread, which
//! collapses bursts within the debounce window and then rebuilds the whole
//! generation. The worker only holds a weak reference to the registry, so
//! dropping the last strong reference still shuts everything down.

use crate::registry::{ModuleRegistry, RegistrySettings};
use edge_common::{Error, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) enum WatchSignal {
    Changed(Vec<PathBuf>),
    Stop,
}

/// What to watch and which event paths count.
#[derive(Debug, Clone, Default)]
struct WatchTargets {
    /// Directory → whether to watch it recursively.
    directories: BTreeMap<PathBuf, bool>,
    /// Plugin directory: any change underneath it counts.
    trees: Vec<PathBuf>,
    /// Individual files, matched exactly.
    files: Vec<PathBuf>,
    /// Bake output: rewritten by every reload, so never a trigger.
    excluded: Option<PathBuf>,
}

impl WatchTargets {
    fn new(settings: &RegistrySettings) -> Self {
        let mut targets = Self::default();
        for path in settings.watched_paths() {
            let canonical = canonical(&path);
            if canonical.is_dir() {
                targets.directories.insert(canonical.clone(), true);
                targets.trees.push(canonical);
            } else if let Some(parent) = canonical.parent() {
                targets
                    .directories
                    .entry(parent.to_path_buf())
                    .or_insert(false);
                targets.files.push(canonical);
            }
        }
        targets.excluded = settings.bake_output.as_deref().map(canonical);
        targets
    }

    fn matches(&self, path: &Path) -> bool {
        if self.excluded.as_ref().is_some_and(|out| path.starts_with(out)) {
            return false;
        }
        self.files.iter().any(|f| f == path) || self.trees.iter().any(|t| path.starts_with(t))
    }
}

fn canonical(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    // A file that does not exist yet can still appear later; resolve its parent.
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Live watch state owned by the registry.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    tx: Sender<WatchSignal>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl WatchHandle {
    fn shutdown(mut self) {
        let _ = self.tx.send(WatchSignal::Stop);
        if let Some(worker) = self.worker.take() {
            // The worker can end up dropping the registry itself; it cannot join itself.
            if thread::current().id() != self.worker_id && worker.join().is_err() {
                warn!("watch worker panicked");
            }
        }
        debug!("file watch closed");
    }
}

impl ModuleRegistry {
    /// Start watching the plugin path and variable files. A second call is a no-op.
    pub fn watch(self: &Arc<Self>) -> Result<()> {
        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| Error::Watch("watch state lock poisoned".to_string()))?;
        if slot.is_some() {
            debug!("file watch already active");
            return Ok(());
        }

        let targets = WatchTargets::new(self.settings());
        let (tx, rx) = mpsc::channel();

        let event_tx = tx.clone();
        let filter = targets.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let paths: Vec<PathBuf> = event
                        .paths
                        .into_iter()
                        .filter(|p| filter.matches(p))
                        .collect();
                    if !paths.is_empty() {
                        let _ = event_tx.send(WatchSignal::Changed(paths));
                    }
                }
                Err(err) => warn!(error = %err, "file watch error"),
            })
            .map_err(|e| Error::Watch(e.to_string()))?;

        for (dir, recursive) in &targets.directories {
            let mode = if *recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher
                .watch(dir, mode)
                .map_err(|e| Error::Watch(format!("{}: {e}", dir.display())))?;
        }

        let registry = Arc::downgrade(self);
        let debounce = self.settings().debounce;
        let worker = thread::Builder::new()
            .name("edge-runner-watch".to_string())
            .spawn(move || run_worker(registry, rx, debounce))
            .map_err(|e| Error::Watch(e.to_string()))?;

        info!(
            directories = targets.directories.len(),
            debounce_ms = debounce.as_millis() as u64,
            "watching plugin sources"
        );
        *slot = Some(WatchHandle {
            _watcher: watcher,
            tx,
            worker_id: worker.thread().id(),
            worker: Some(worker),
        });
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Stop watching and join the worker. Safe to call more than once.
    pub fn close(&self) {
        let handle = match self.watcher.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }
}

impl Drop for ModuleRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(registry: Weak<ModuleRegistry>, rx: Receiver<WatchSignal>, debounce: Duration) {
    while let Ok(WatchSignal::Changed(mut changed)) = rx.recv() {
        loop {
            match rx.recv_timeout(debounce) {
                Ok(WatchSignal::Changed(more)) => changed.extend(more),
                Ok(WatchSignal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        let Some(registry) = registry.upgrade() else {
            return;
        };
        changed.sort();
        changed.dedup();
        info!(
            files = changed.len(),
            first = %changed[0].display(),
            "plugin sources changed; reloading"
        );
        // Failures are logged by reload and the previous generation stays active.
        let _ = registry.reload();
    }
}
