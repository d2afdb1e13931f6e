//! Subscription registry: watched path → live subscriber set.
//!
//! The only structure mutated from more than one task. All access goes
//! through one RwLock discipline: subscribe/unsubscribe take the write
//! lock (and arm/disarm the filesystem watch inside the same critical
//! section), broadcast takes a read-lock snapshot and delivers outside
//! the lock.
//!
//! Invariants:
//! - a path key exists iff its subscriber set is non-empty
//! - a subscriber handle appears under at most one path
//! - first subscriber arms the watch, last unsubscribe disarms it

mod path;
mod subscriber;

pub use path::{PathError, WatchedPath};
pub use subscriber::{Subscriber, SubscriberId};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::compile::{CompileOptions, CompileResult};
use crate::protocol::ServerMessage;
use crate::watch::PathWatch;

/// Per-path subscription state.
struct PathEntry {
    subscribers: FxHashMap<SubscriberId, Subscriber>,
    /// Most recently subscribed or option-updated subscriber; its options
    /// drive change-triggered compiles for this path.
    current: Option<SubscriberId>,
    /// False when watch arming failed: subscriptions still work but no
    /// change-driven recompiles fire until a later arm succeeds.
    armed: bool,
}

/// Thread-safe map of watched paths to subscriber sets, owning the
/// filesystem watch capability.
pub struct SubscriptionRegistry {
    root: PathBuf,
    inner: RwLock<FxHashMap<WatchedPath, PathEntry>>,
    watch: Mutex<Box<dyn PathWatch>>,
}

impl SubscriptionRegistry {
    pub fn new(root: PathBuf, watch: Box<dyn PathWatch>) -> Self {
        Self {
            root,
            inner: RwLock::new(FxHashMap::default()),
            watch: Mutex::new(watch),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Add a subscriber under a path, arming the watch on the first one.
    ///
    /// Idempotent for an already-registered subscriber. Watch-arm failure
    /// is logged and leaves the path in a degraded state; the next
    /// subscriber retries arming.
    pub fn subscribe(&self, path: &WatchedPath, subscriber: Subscriber) {
        let id = subscriber.id();
        let mut inner = self.inner.write();
        let entry = inner.entry(path.clone()).or_insert_with(|| PathEntry {
            subscribers: FxHashMap::default(),
            current: None,
            armed: false,
        });

        if !entry.armed {
            let absolute = path.resolve(&self.root);
            match self.watch.lock().watch(&absolute) {
                Ok(()) => entry.armed = true,
                Err(e) => {
                    crate::log!("watch"; "cannot watch {}: {} (no change-driven recompiles)", path, e);
                }
            }
        }

        entry.subscribers.entry(id).or_insert(subscriber);
        entry.current = Some(id);
        crate::debug!("watch"; "{} subscribed to {} ({} total)", id, path, entry.subscribers.len());
    }

    /// Remove a subscriber. Disarms the watch and drops the map entry
    /// when the set empties. No-op for unknown subscribers or paths.
    pub fn unsubscribe(&self, path: &WatchedPath, id: SubscriberId) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.get_mut(path) else {
            return;
        };
        if entry.subscribers.remove(&id).is_none() {
            return;
        }
        crate::debug!("watch"; "{} unsubscribed from {} ({} left)", id, path, entry.subscribers.len());

        if entry.current == Some(id) {
            entry.current = entry.subscribers.keys().next().copied();
        }

        if entry.subscribers.is_empty() {
            let armed = entry.armed;
            inner.remove(path);
            if armed {
                self.watch.lock().unwatch(&path.resolve(&self.root));
                crate::debug!("watch"; "disarmed {}", path);
            }
        }
    }

    /// Deliver a result to every current subscriber of a path.
    ///
    /// Enumerates an atomic snapshot taken under the read lock, then
    /// delivers outside any lock. A subscriber whose outbox is stalled or
    /// gone is force-closed and unsubscribed; delivery to the others
    /// continues regardless.
    pub fn broadcast(&self, path: &WatchedPath, result: &CompileResult) {
        let snapshot: Vec<Subscriber> = {
            let inner = self.inner.read();
            match inner.get(path) {
                Some(entry) => entry.subscribers.values().cloned().collect(),
                None => return,
            }
        };

        let msg = ServerMessage::result(result);
        let mut dropped = Vec::new();
        for subscriber in &snapshot {
            if !subscriber.deliver(msg.clone()) {
                crate::debug!("session"; "dropping stalled viewer {} on {}", subscriber.id(), path);
                subscriber.close();
                dropped.push(subscriber.id());
            }
        }
        crate::debug!("session"; "broadcast {} to {} viewers", path, snapshot.len() - dropped.len());

        for id in dropped {
            self.unsubscribe(path, id);
        }
    }

    /// Number of live subscribers for a path.
    pub fn subscriber_count(&self, path: &WatchedPath) -> usize {
        self.inner
            .read()
            .get(path)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Options driving change-triggered compiles for a path: those of the
    /// current subscriber, `None` meaning extension defaults.
    pub fn options_for(&self, path: &WatchedPath) -> Option<CompileOptions> {
        let inner = self.inner.read();
        let entry = inner.get(path)?;
        let current = entry.current?;
        entry.subscribers.get(&current)?.options()
    }

    /// Mark a subscriber as the path's current one (called by its session
    /// after an option update).
    pub fn touch(&self, path: &WatchedPath, id: SubscriberId) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(path)
            && entry.subscribers.contains_key(&id)
        {
            entry.current = Some(id);
        }
    }

    #[cfg(test)]
    fn contains(&self, path: &WatchedPath) -> bool {
        self.inner.read().contains_key(path)
    }
}

/// Scoped subscription: unsubscribes on drop, so session cleanup does not
/// depend on every exit path remembering to call it.
pub struct Subscription {
    registry: Arc<SubscriptionRegistry>,
    path: WatchedPath,
    id: SubscriberId,
}

impl Subscription {
    /// Register the subscriber and hold the registration for the scope of
    /// the returned guard.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        path: WatchedPath,
        subscriber: Subscriber,
    ) -> Self {
        let id = subscriber.id();
        registry.subscribe(&path, subscriber);
        Self { registry, path, id }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.path, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records arm/disarm calls; can be told to fail arming.
    #[derive(Clone, Default)]
    struct FakeWatch {
        armed: Arc<parking_lot::Mutex<Vec<PathBuf>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl PathWatch for FakeWatch {
        fn watch(&mut self, path: &Path) -> anyhow::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("inotify limit reached");
            }
            self.armed.lock().push(path.to_path_buf());
            Ok(())
        }

        fn unwatch(&mut self, path: &Path) {
            self.armed.lock().retain(|p| p != path);
        }
    }

    fn registry_with_fake() -> (Arc<SubscriptionRegistry>, FakeWatch) {
        let fake = FakeWatch::default();
        let registry = Arc::new(SubscriptionRegistry::new(
            PathBuf::from("/srv/src"),
            Box::new(fake.clone()),
        ));
        (registry, fake)
    }

    fn path(s: &str) -> WatchedPath {
        WatchedPath::new(s).unwrap()
    }

    fn result() -> CompileResult {
        CompileResult::success("out", "src", "c")
    }

    #[test]
    fn test_entry_exists_iff_subscribers_present() {
        let (registry, fake) = registry_with_fake();
        let add = path("Add.c");

        assert!(!registry.contains(&add));

        let (a, _rx_a) = Subscriber::new();
        let (b, _rx_b) = Subscriber::new();
        let sub_a = Subscription::new(Arc::clone(&registry), add.clone(), a);
        let sub_b = Subscription::new(Arc::clone(&registry), add.clone(), b);
        assert!(registry.contains(&add));
        assert_eq!(registry.subscriber_count(&add), 2);
        // first subscriber armed the watch, second did not re-arm
        assert_eq!(*fake.armed.lock(), vec![PathBuf::from("/srv/src/Add.c")]);

        drop(sub_a);
        assert!(registry.contains(&add));
        assert_eq!(registry.subscriber_count(&add), 1);

        drop(sub_b);
        assert!(!registry.contains(&add));
        assert_eq!(registry.subscriber_count(&add), 0);
        assert!(fake.armed.lock().is_empty());
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let (registry, _fake) = registry_with_fake();
        let add = path("Add.c");

        let (a, rx) = Subscriber::new();
        let sub1 = Subscription::new(Arc::clone(&registry), add.clone(), a.clone());
        let sub2 = Subscription::new(Arc::clone(&registry), add.clone(), a);
        assert_eq!(registry.subscriber_count(&add), 1);

        // one broadcast, exactly one delivered message
        registry.broadcast(&add, &result());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        drop(sub1);
        drop(sub2);
        assert_eq!(registry.subscriber_count(&add), 0);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let (registry, _fake) = registry_with_fake();
        let add = path("Add.c");

        let (a, _rx) = Subscriber::new();
        let (stranger, _rx2) = Subscriber::new();
        let _sub = Subscription::new(Arc::clone(&registry), add.clone(), a);

        registry.unsubscribe(&add, stranger.id());
        registry.unsubscribe(&path("Other.c"), stranger.id());
        assert_eq!(registry.subscriber_count(&add), 1);
    }

    #[test]
    fn test_disarm_then_rearm_on_new_subscriber() {
        let (registry, fake) = registry_with_fake();
        let add = path("Add.c");

        let (a, _rx_a) = Subscriber::new();
        let sub = Subscription::new(Arc::clone(&registry), add.clone(), a);
        drop(sub);
        assert!(fake.armed.lock().is_empty());

        // a stale change event between disarm and now is inert
        registry.broadcast(&add, &result());

        let (b, rx_b) = Subscriber::new();
        let _sub = Subscription::new(Arc::clone(&registry), add.clone(), b);
        assert_eq!(fake.armed.lock().len(), 1);

        registry.broadcast(&add, &result());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_failed_subscriber_does_not_block_others() {
        let (registry, _fake) = registry_with_fake();
        let add = path("Add.c");

        let (a, rx_a) = Subscriber::new();
        let (b, rx_b) = Subscriber::new();
        let _sub_a = Subscription::new(Arc::clone(&registry), add.clone(), a.clone());
        let _sub_b = Subscription::new(Arc::clone(&registry), add.clone(), b);

        // A's session is gone: its outbox receiver is dropped
        drop(rx_a);

        registry.broadcast(&add, &result());

        // B got its message, A was force-closed and removed
        assert!(rx_b.try_recv().is_ok());
        assert!(a.is_closed());
        assert_eq!(registry.subscriber_count(&add), 1);
    }

    #[test]
    fn test_arm_failure_degrades_then_recovers() {
        let (registry, fake) = registry_with_fake();
        let add = path("Add.c");

        fake.fail_next.store(true, Ordering::SeqCst);
        let (a, rx_a) = Subscriber::new();
        let _sub_a = Subscription::new(Arc::clone(&registry), add.clone(), a);

        // degraded: subscribed but not armed
        assert_eq!(registry.subscriber_count(&add), 1);
        assert!(fake.armed.lock().is_empty());

        // broadcasts (e.g. manual recompiles) still deliver
        registry.broadcast(&add, &result());
        assert!(rx_a.try_recv().is_ok());

        // next subscriber retries arming
        let (b, _rx_b) = Subscriber::new();
        let _sub_b = Subscription::new(Arc::clone(&registry), add.clone(), b);
        assert_eq!(fake.armed.lock().len(), 1);
    }

    #[test]
    fn test_options_follow_current_subscriber() {
        let (registry, _fake) = registry_with_fake();
        let add = path("Add.c");

        let (a, _rx_a) = Subscriber::new();
        let (b, _rx_b) = Subscriber::new();
        let _sub_a = Subscription::new(Arc::clone(&registry), add.clone(), a.clone());
        let _sub_b = Subscription::new(Arc::clone(&registry), add.clone(), b.clone());

        // nobody set explicit options: extension defaults apply
        assert_eq!(registry.options_for(&add), None);

        let mut opts = CompileOptions::defaults_for("Add.c").unwrap();
        opts.flags.push("-O2".into());
        a.set_options(opts.clone());
        registry.touch(&add, a.id());
        assert_eq!(registry.options_for(&add), Some(opts.clone()));

        // current leaves; policy falls back to a remaining subscriber
        registry.unsubscribe(&add, a.id());
        assert_eq!(registry.options_for(&add), b.options());
    }

    #[test]
    fn test_broadcasts_preserve_per_path_order() {
        let (registry, _fake) = registry_with_fake();
        let add = path("Add.c");

        let (a, rx) = Subscriber::new();
        let _sub = Subscription::new(Arc::clone(&registry), add.clone(), a);

        registry.broadcast(&add, &CompileResult::success("first", "s", "c"));
        registry.broadcast(&add, &CompileResult::success("second", "s", "c"));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first, second) {
            (
                ServerMessage::Result { output: o1, .. },
                ServerMessage::Result { output: o2, .. },
            ) => {
                assert_eq!(o1, "first");
                assert_eq!(o2, "second");
            }
            other => panic!("expected two results, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_churn_keeps_invariant() {
        let (registry, _fake) = registry_with_fake();
        let add = path("Add.c");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let add = add.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let (s, _rx) = Subscriber::new();
                    let sub = Subscription::new(Arc::clone(&registry), add.clone(), s);
                    registry.broadcast(&add, &result());
                    drop(sub);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // all churn done: entry must be gone again
        assert!(!registry.contains(&add));
    }
}
