//! Subscriber handles.
//!
//! A subscriber is the registry's view of one viewer connection: a bounded
//! outbox the broadcast loop pushes into, the session's current compile
//! options, and a close flag the session polls. The session owns the
//! receiving half of the outbox and is the only writer of the options.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::compile::CompileOptions;
use crate::protocol::ServerMessage;

/// Outbox capacity. A viewer further behind than this is considered stalled.
const OUTBOX_CAPACITY: usize = 32;

/// How long a broadcast may wait on one full outbox before giving up on
/// that subscriber. Keeps one slow viewer from stalling the dispatcher.
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one viewer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared handle to one viewer connection.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    outbox: Sender<ServerMessage>,
    /// Session-owned compile options; `None` means extension defaults.
    options: Arc<Mutex<Option<CompileOptions>>>,
    closed: Arc<AtomicBool>,
}

impl Subscriber {
    /// Create a subscriber and the outbox receiver its session drains.
    pub fn new() -> (Self, Receiver<ServerMessage>) {
        let (tx, rx) = bounded(OUTBOX_CAPACITY);
        let subscriber = Self {
            id: SubscriberId::next(),
            outbox: tx,
            options: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (subscriber, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue a message for the session's write loop.
    ///
    /// Bounded-time: waits at most [`SEND_TIMEOUT`] on a full outbox.
    /// Returns false when the subscriber should be dropped (stalled or
    /// its session went away).
    pub fn deliver(&self, msg: ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbox.send_timeout(msg, SEND_TIMEOUT).is_ok()
    }

    /// Current options, if the session has set any.
    pub fn options(&self) -> Option<CompileOptions> {
        self.options.lock().clone()
    }

    /// Replace this subscriber's options. Called only by its own session.
    pub fn set_options(&self, options: CompileOptions) {
        *self.options.lock() = Some(options);
    }

    /// Mark the subscriber closed; its session loop exits on next poll.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
