//! Server lifecycle: listener binding, session spawning, dispatcher
//! runtime, and shutdown signalling.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use crate::compile::{Compile, CompileRunner};
use crate::config::Config;
use crate::dispatch::NotificationDispatcher;
use crate::registry::SubscriptionRegistry;
use crate::session;
use crate::watch::NotifyWatch;

/// Maximum number of port binding attempts.
const MAX_PORT_RETRIES: u16 = 10;

/// Global shutdown flag, set by the Ctrl+C handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the Ctrl+C handler (before any blocking operations).
pub fn setup_shutdown_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        crate::log!("serve"; "shutting down");
        request_shutdown();
    })?;
    Ok(())
}

/// Shared state handed to every session thread.
pub struct ServeContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub compiler: Arc<dyn Compile>,
}

/// Run the watch server until shutdown.
pub fn run(config: &Config) -> Result<()> {
    let root = config.source_root()?;

    let (watch, events) = NotifyWatch::new()?;
    let registry = Arc::new(SubscriptionRegistry::new(root.clone(), Box::new(watch)));
    let compiler: Arc<dyn Compile> = Arc::new(CompileRunner);

    let dispatcher = NotificationDispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&compiler),
        events,
        config.watch.debounce_ms,
    );
    let dispatcher_handle = spawn_dispatcher(dispatcher);

    let (listener, addr) = bind_with_retry(config.serve.interface, config.serve.port)?;
    listener.set_nonblocking(true)?;
    crate::log!("serve"; "ws://{} watching {}", addr, root.display());

    let ctx = Arc::new(ServeContext { registry, compiler });
    accept_loop(&listener, &ctx);

    wait_for_dispatcher(dispatcher_handle);
    Ok(())
}

/// Bind to the specified interface and port, with automatic port retry.
fn bind_with_retry(interface: std::net::IpAddr, base_port: u16) -> Result<(TcpListener, SocketAddr)> {
    let mut last_error = None;

    for offset in 0..MAX_PORT_RETRIES {
        let port = base_port.saturating_add(offset);
        let addr = SocketAddr::new(interface, port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                if offset > 0 {
                    crate::log!("serve"; "port {} in use, using {} instead", base_port, port);
                }
                let addr = listener.local_addr()?;
                return Ok((listener, addr));
            }
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        }
    }

    Err(anyhow::anyhow!(
        "Failed to bind after {} attempts (ports {}-{}): {}",
        MAX_PORT_RETRIES,
        base_port,
        base_port.saturating_add(MAX_PORT_RETRIES - 1),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Accept viewers until shutdown, one session thread per connection.
fn accept_loop(listener: &TcpListener, ctx: &Arc<ServeContext>) {
    loop {
        if is_shutdown() {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                crate::debug!("serve"; "connection from {}", addr);
                // Blocking mode for the websocket handshake; the session
                // switches to non-blocking afterwards.
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = Arc::clone(ctx);
                thread::spawn(move || session::handle_connection(stream, ctx));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                crate::log!("serve"; "accept error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// The dispatcher runs on its own tokio runtime so the blocking accept
/// loop stays on the main thread.
fn spawn_dispatcher(dispatcher: NotificationDispatcher) -> JoinHandle<()> {
    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                crate::log!("error"; "failed to create dispatcher runtime: {}", e);
                return;
            }
        };
        rt.block_on(dispatcher.run());
    })
}

/// Wait for the dispatcher to stop gracefully (max 2 seconds).
fn wait_for_dispatcher(handle: JoinHandle<()>) {
    for _ in 0..40 {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}
