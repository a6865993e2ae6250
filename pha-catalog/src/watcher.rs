//! Debounced file-system watch for the catalog directory (spec §4.1: catalog
//! reload must also be driven by file-watch, not only the manual
//! `ReloadCatalog` command).
//!
//! This only detects and coalesces changes -- it never touches a [`Catalog`]
//! directly, so the policy of *when* to reload (poll interval, what to do on
//! failure) stays with the caller. [`Catalog`]: crate::catalog::Catalog

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create catalog file watcher: {0}")]
    Create(notify::Error),
    #[error("failed to watch catalog directory {0}: {1}")]
    Watch(PathBuf, notify::Error),
}

/// Watches a catalog directory for `*.toml` changes and reports the changed
/// paths once a debounce window has elapsed since the most recent one, so a
/// burst of saves from an editor collapses into a single reload.
pub struct CatalogWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<Result<Event, notify::Error>>,
    debounce: Duration,
    last_event_at: Option<Instant>,
    pending: HashSet<PathBuf>,
}

impl CatalogWatcher {
    pub fn new(dir: &Path, debounce: Duration) -> Result<Self, WatchError> {
        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(WatchError::Create)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Watch(dir.to_path_buf(), e))?;

        Ok(Self {
            _watcher: watcher,
            rx,
            debounce,
            last_event_at: None,
            pending: HashSet::new(),
        })
    }

    /// Drains any pending filesystem events and returns the changed paths
    /// once the debounce window has elapsed since the most recent one.
    /// Non-blocking; call this periodically from a timer tick.
    pub fn poll(&mut self) -> Option<Vec<PathBuf>> {
        let mut saw_event = false;
        loop {
            match self.rx.try_recv() {
                Ok(Ok(event)) if is_catalog_change(&event) => {
                    self.pending.extend(event.paths.iter().cloned());
                    saw_event = true;
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if saw_event {
            self.last_event_at = Some(Instant::now());
        }

        match self.last_event_at {
            Some(at) if !self.pending.is_empty() && at.elapsed() >= self.debounce => {
                self.last_event_at = None;
                Some(self.pending.drain().collect())
            }
            _ => None,
        }
    }
}

fn is_catalog_change(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
        && event
            .paths
            .iter()
            .any(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
}
