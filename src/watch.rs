//! File watcher over the test directories.
//!
//! Test discovery itself happens elsewhere; this only reports whether the
//! configured paths are being watched and when they last changed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("none of the watch paths exist: {0:?}")]
    NoPaths(Vec<PathBuf>),
    #[error("file watcher: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchStatus {
    pub watching: bool,
    pub paths: Vec<PathBuf>,
    pub recursive: bool,
    pub events: u64,
    pub last_change: Option<DateTime<Utc>>,
    pub last_path: Option<PathBuf>,
}

#[derive(Default)]
struct Activity {
    events: AtomicU64,
    last: Mutex<Option<(DateTime<Utc>, Option<PathBuf>)>>,
}

/// Recover the guard from a poisoned lock; the data is plain values.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TestWatcher {
    config: WatchConfig,
    activity: Arc<Activity>,
    watcher: Mutex<Option<(RecommendedWatcher, Vec<PathBuf>)>>,
}

impl TestWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            activity: Arc::new(Activity::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Start watching. Calling it again while watching is a no-op.
    pub fn start(&self) -> Result<WatchStatus, WatchError> {
        let mut slot = lock(&self.watcher);
        if slot.is_none() {
            let existing: Vec<PathBuf> = self.config.paths.iter().filter(|p| p.exists()).cloned().collect();
            if existing.is_empty() {
                return Err(WatchError::NoPaths(self.config.paths.clone()));
            }

            let activity = self.activity.clone();
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) if !matches!(event.kind, EventKind::Access(_)) => {
                    activity.events.fetch_add(1, Ordering::Relaxed);
                    *lock(&activity.last) = Some((Utc::now(), event.paths.first().cloned()));
                    debug!(kind = ?event.kind, paths = ?event.paths, "test files changed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "watch error"),
            })?;

            let mode = if self.config.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            for path in &existing {
                watcher.watch(path, mode)?;
            }
            info!(paths = ?existing, "watching test directories");
            *slot = Some((watcher, existing));
        }
        drop(slot);
        Ok(self.status())
    }

    pub fn status(&self) -> WatchStatus {
        let slot = lock(&self.watcher);
        let last = lock(&self.activity.last).clone();
        WatchStatus {
            watching: slot.is_some(),
            paths: match slot.as_ref() {
                Some((_, paths)) => paths.clone(),
                None => self.config.paths.clone(),
            },
            recursive: self.config.recursive,
            events: self.activity.events.load(Ordering::Relaxed),
            last_change: last.as_ref().map(|(at, _)| *at),
            last_path: last.and_then(|(_, path)| path),
        }
    }
}
