//! Notification dispatcher: filesystem events → compile-and-broadcast.
//!
//! Consumes the single watch event stream (bridged from the sync notify
//! channel onto a tokio channel), debounces bursts, and runs one
//! compile-and-broadcast cycle per content write to a subscribed path.
//! Stale events racing with watch teardown are inert: a path with zero
//! subscribers is skipped before any file is read.

use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use crate::compile::{Compile, CompileOptions, CompileResult};
use crate::registry::{SubscriptionRegistry, WatchedPath};
use crate::watch::debounce::Debouncer;
use crate::watch::{ChangeKind, WatchEvent};

/// Buffer for the sync → async event bridge.
const BRIDGE_BUFFER: usize = 64;

/// Upper bound on the select sleep so the shutdown flag is noticed even
/// when the event stream is idle.
const SHUTDOWN_POLL: std::time::Duration = std::time::Duration::from_millis(200);

pub struct NotificationDispatcher {
    registry: Arc<SubscriptionRegistry>,
    compiler: Arc<dyn Compile>,
    events: Receiver<WatchEvent>,
    debounce_ms: u64,
}

impl NotificationDispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        compiler: Arc<dyn Compile>,
        events: Receiver<WatchEvent>,
        debounce_ms: u64,
    ) -> Self {
        Self {
            registry,
            compiler,
            events,
            debounce_ms,
        }
    }

    /// Run the dispatch loop until the event stream closes or shutdown.
    pub async fn run(self) {
        let Self {
            registry,
            compiler,
            events,
            debounce_ms,
        } = self;
        let (bridge_tx, mut bridge_rx) = tokio::sync::mpsc::channel::<WatchEvent>(BRIDGE_BUFFER);

        // notify delivers on a sync channel; pump it onto the async side
        std::thread::spawn(move || {
            while let Ok(event) = events.recv() {
                if bridge_tx.blocking_send(event).is_err() {
                    break; // receiver dropped
                }
            }
        });

        let mut debouncer = Debouncer::new(debounce_ms);
        loop {
            tokio::select! {
                biased;
                maybe_event = bridge_rx.recv() => match maybe_event {
                    Some(event) => debouncer.add_event(event),
                    None => break,
                },
                _ = tokio::time::sleep(debouncer.sleep_duration().min(SHUTDOWN_POLL)) => {
                    if crate::serve::is_shutdown() {
                        break;
                    }
                    let Some(batch) = debouncer.take_if_ready() else {
                        continue;
                    };
                    for (absolute, kind) in batch {
                        handle_change(&registry, compiler.as_ref(), &absolute, kind);
                    }
                }
            }
        }
        crate::debug!("watch"; "dispatcher stopped");
    }
}

/// One change event → at most one compile-and-broadcast cycle.
fn handle_change(
    registry: &SubscriptionRegistry,
    compiler: &dyn Compile,
    absolute: &Path,
    kind: ChangeKind,
) {
    // Only content writes trigger recompiles; a removed file surfaces
    // as a read failure on its next write event, if any.
    if kind != ChangeKind::Modified {
        crate::debug!("watch"; "ignoring {} event: {}", kind.label(), absolute.display());
        return;
    }

    let Some(path) = WatchedPath::from_absolute(registry.root(), absolute) else {
        crate::debug!("watch"; "event outside root: {}", absolute.display());
        return;
    };

    // Teardown race: the last subscriber may have left after this event
    // was queued. The disarmed watch is the primary defense; this check
    // makes the stale event a no-op.
    if registry.subscriber_count(&path) == 0 {
        crate::debug!("watch"; "no subscribers for {}, skipping", path);
        return;
    }

    let options = registry.options_for(&path);
    let result = compile_file(compiler, registry.root(), &path, options.as_ref());
    registry.broadcast(&path, &result);
}

/// One compile cycle: read the file, resolve options, invoke the tool.
///
/// Shared by the dispatcher (broadcast cycles) and sessions (subscribe-time
/// and option-update cycles). Never invokes a tool for an unsupported file
/// type, and turns a vanished file into a failed result instead of a
/// dropped event.
pub fn compile_file(
    compiler: &dyn Compile,
    root: &Path,
    path: &WatchedPath,
    options: Option<&CompileOptions>,
) -> CompileResult {
    let source = match std::fs::read_to_string(path.resolve(root)) {
        Ok(source) => source,
        Err(e) => {
            return CompileResult::failure(format!("failed to read source file: {e}"), "", "");
        }
    };

    let resolved = match options {
        Some(options) => Some(options.clone()),
        None => CompileOptions::defaults_for(path.file_name()),
    };
    let Some(options) = resolved else {
        let ext = Path::new(path.file_name())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        return CompileResult::failure(format!("unsupported file type: .{ext}"), source, "");
    };

    compiler.compile(path.file_name(), &source, &options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::Toolchain;
    use parking_lot::Mutex;

    /// Records invocations and returns a canned result.
    struct FakeCompiler {
        calls: Mutex<Vec<(String, String, CompileOptions)>>,
    }

    impl FakeCompiler {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Compile for FakeCompiler {
        fn compile(
            &self,
            file_name: &str,
            source: &str,
            options: &CompileOptions,
        ) -> CompileResult {
            self.calls
                .lock()
                .push((file_name.to_string(), source.to_string(), options.clone()));
            CompileResult::success("fake output", source, options.toolchain.language())
        }
    }

    fn sources_with(file_name: &str, contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(file_name), contents).unwrap();
        dir
    }

    #[test]
    fn test_compile_uses_extension_defaults() {
        let dir = sources_with("Add.c", "int add(int a, int b) { return a + b; }");
        let compiler = FakeCompiler::new();
        let path = WatchedPath::new("Add.c").unwrap();

        let result = compile_file(&compiler, dir.path(), &path, None);

        assert!(result.success);
        assert_eq!(result.language, "c");
        assert_eq!(result.source_code, "int add(int a, int b) { return a + b; }");

        let calls = compiler.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "Add.c");
        assert_eq!(calls[0].2.toolchain, Toolchain::Clang);
    }

    #[test]
    fn test_unsupported_extension_skips_compiler() {
        let dir = sources_with("Foo.txt", "hello");
        let compiler = FakeCompiler::new();
        let path = WatchedPath::new("Foo.txt").unwrap();

        let result = compile_file(&compiler, dir.path(), &path, None);

        assert!(!result.success);
        assert!(result.error.contains("unsupported file type"));
        assert_eq!(result.source_code, "hello");
        assert!(result.language.is_empty());
        assert!(compiler.calls.lock().is_empty());
    }

    #[test]
    fn test_vanished_file_becomes_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = FakeCompiler::new();
        let path = WatchedPath::new("Gone.c").unwrap();

        let result = compile_file(&compiler, dir.path(), &path, None);

        assert!(!result.success);
        assert!(result.error.contains("failed to read source file"));
        assert!(result.source_code.is_empty());
        assert!(compiler.calls.lock().is_empty());
    }

    struct NoopWatch;

    impl crate::watch::PathWatch for NoopWatch {
        fn watch(&mut self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
        fn unwatch(&mut self, _path: &Path) {}
    }

    #[test]
    fn test_change_with_no_subscribers_is_inert() {
        let dir = sources_with("Add.c", "int main() {}");
        let registry = Arc::new(SubscriptionRegistry::new(
            dir.path().to_path_buf(),
            Box::new(NoopWatch),
        ));
        let compiler = FakeCompiler::new();

        // stale event racing with watch teardown: nobody subscribed
        handle_change(
            &registry,
            &compiler,
            &dir.path().join("Add.c"),
            ChangeKind::Modified,
        );
        assert!(compiler.calls.lock().is_empty());
    }

    #[test]
    fn test_change_compiles_and_broadcasts() {
        use crate::protocol::ServerMessage;
        use crate::registry::{Subscriber, Subscription};

        let dir = sources_with("Add.c", "int main() {}");
        let registry = Arc::new(SubscriptionRegistry::new(
            dir.path().to_path_buf(),
            Box::new(NoopWatch),
        ));
        let compiler = FakeCompiler::new();

        let (viewer, rx) = Subscriber::new();
        let _sub = Subscription::new(
            Arc::clone(&registry),
            WatchedPath::new("Add.c").unwrap(),
            viewer,
        );

        // events outside the root and non-write events are inert
        handle_change(&registry, &compiler, Path::new("/tmp/Add.c"), ChangeKind::Modified);
        handle_change(
            &registry,
            &compiler,
            &dir.path().join("Add.c"),
            ChangeKind::Removed,
        );
        assert!(compiler.calls.lock().is_empty());

        handle_change(
            &registry,
            &compiler,
            &dir.path().join("Add.c"),
            ChangeKind::Modified,
        );
        assert_eq!(compiler.calls.lock().len(), 1);
        match rx.try_recv().unwrap() {
            ServerMessage::Result {
                success, output, ..
            } => {
                assert!(success);
                assert_eq!(output, "fake output");
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_options_override_defaults() {
        let dir = sources_with("Add.c", "int main() {}");
        let compiler = FakeCompiler::new();
        let path = WatchedPath::new("Add.c").unwrap();

        let mut options = CompileOptions::defaults_for("Add.c").unwrap();
        options.flags.push("-O2".into());
        let result = compile_file(&compiler, dir.path(), &path, Some(&options));

        assert!(result.success);
        let calls = compiler.calls.lock();
        assert_eq!(calls[0].2.flags, vec!["-O2".to_string()]);
    }
}
