//! Pure debouncer: timing and per-path event coalescing.
//!
//! Editors write files several times per save; the debouncer collapses a
//! burst into one event per path and releases the batch once the stream
//! has been quiet for the configured window.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::{ChangeKind, WatchEvent};

pub struct Debouncer {
    window: Duration,
    /// Path → ChangeKind (dedup is free via HashMap key uniqueness)
    changes: FxHashMap<PathBuf, ChangeKind>,
    last_event: Option<Instant>,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            changes: FxHashMap::default(),
            last_event: None,
        }
    }

    /// Record an event, applying coalescing rules:
    /// - Removed + Created/Modified → the restore event wins
    /// - Modified + Removed → upgrade to Removed
    /// - Created + Removed → appeared then vanished, discard
    /// - otherwise: first event wins
    pub fn add_event(&mut self, event: WatchEvent) {
        let WatchEvent { path, kind } = event;

        if let Some(&existing) = self.changes.get(&path) {
            match (existing, kind) {
                (ChangeKind::Removed, ChangeKind::Created | ChangeKind::Modified) => {
                    self.changes.insert(path, kind);
                }
                (ChangeKind::Modified, ChangeKind::Removed) => {
                    self.changes.insert(path, ChangeKind::Removed);
                }
                (ChangeKind::Created, ChangeKind::Removed) => {
                    self.changes.remove(&path);
                }
                _ => return,
            }
        } else {
            crate::debug!("watch"; "event {}: {}", kind.label(), path.display());
            self.changes.insert(path, kind);
        }
        self.last_event = Some(Instant::now());
    }

    /// Take the coalesced batch if the quiet window has elapsed.
    pub fn take_if_ready(&mut self) -> Option<FxHashMap<PathBuf, ChangeKind>> {
        if !self.is_ready() {
            return None;
        }

        self.last_event = None;
        let changes = std::mem::take(&mut self.changes);
        (!changes.is_empty()).then_some(changes)
    }

    fn is_ready(&self) -> bool {
        match self.last_event {
            Some(last) => last.elapsed() >= self.window && !self.changes.is_empty(),
            None => false,
        }
    }

    /// Precise sleep duration until the batch could next be ready.
    pub fn sleep_duration(&self) -> Duration {
        let Some(last_event) = self.last_event else {
            return Duration::from_secs(86400);
        };

        self.window
            .saturating_sub(last_event.elapsed())
            .max(Duration::from_millis(1))
    }
}
