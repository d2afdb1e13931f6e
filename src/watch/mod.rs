//! Filesystem watch capability.
//!
//! [`PathWatch`] is the thin seam over the OS watcher: arm a path, disarm
//! a path, and a single ordered stream of [`WatchEvent`]s. The registry
//! owns the capability exclusively; the dispatcher consumes the stream.

pub mod debounce;

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};

use anyhow::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// What happened to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

/// One filesystem change, already filtered of editor noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Capability to arm and disarm watches on individual files.
///
/// Exclusively owned by the subscription registry; arm/disarm calls are
/// serialized by the registry's lock.
pub trait PathWatch: Send {
    fn watch(&mut self, path: &Path) -> Result<()>;
    fn unwatch(&mut self, path: &Path);
}

/// notify-backed implementation. Events arrive on the channel handed out
/// at construction time.
pub struct NotifyWatch {
    watcher: RecommendedWatcher,
}

impl NotifyWatch {
    /// Create the watcher and the event stream it feeds.
    pub fn new() -> Result<(Self, Receiver<WatchEvent>)> {
        let (tx, rx) = std::sync::mpsc::channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => forward_event(&tx, &event),
                Err(e) => crate::log!("watch"; "notify error: {}", e),
            }
        })?;

        Ok((Self { watcher }, rx))
    }
}

impl PathWatch for NotifyWatch {
    fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) {
        if let Err(e) = self.watcher.unwatch(path) {
            // Already-gone watches are fine (file deleted under us).
            crate::debug!("watch"; "unwatch {}: {}", path.display(), e);
        }
    }
}

/// Map a raw notify event onto the stream, dropping metadata-only changes
/// and editor temp files.
fn forward_event(tx: &Sender<WatchEvent>, event: &notify::Event) {
    use notify::EventKind;

    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Modify(modify) => {
            // mtime/atime/chmod noise may trigger endless recompile loops
            if matches!(modify, notify::event::ModifyKind::Metadata(_)) {
                return;
            }
            ChangeKind::Modified
        }
        _ => return,
    };

    for path in &event.paths {
        if is_temp_file(path) {
            continue;
        }
        let _ = tx.send(WatchEvent {
            path: path.clone(),
            kind,
        });
    }
}

/// Check if path is a temp/backup file (editor artifacts).
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}
