//! Per-viewer connection session.
//!
//! State machine: `Connecting → Active → Closed`. Connecting validates the
//! `?file=` parameter before any session state exists; Active holds the
//! subscription, runs the initial compile cycle, and relays option updates
//! into further per-session compile cycles; Closed is terminal and
//! releases the subscription. The release is a drop guard, so it happens
//! on every exit path, including transport errors mid-read.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use thiserror::Error;
use tungstenite::WebSocket;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message;

use crate::compile::CompileOptions;
use crate::dispatch::compile_file;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{PathError, Subscriber, Subscription, WatchedPath};
use crate::serve::ServeContext;

/// Poll interval for the non-blocking read/drain loop.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a connection attempt was rejected before a session existed.
/// Client errors, not server faults.
#[derive(Debug, Error)]
pub enum SessionReject {
    #[error("missing file parameter")]
    MissingParam,
    #[error(transparent)]
    BadPath(#[from] PathError),
    #[error("file not found: {0}")]
    NotFound(String),
}

impl SessionReject {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingParam | Self::BadPath(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let status = self.status();
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = status;
        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Handle one accepted TCP connection end to end.
///
/// Runs on its own thread; never propagates errors to the caller since
/// every failure here concerns only this viewer.
pub fn handle_connection(stream: TcpStream, ctx: Arc<ServeContext>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let root = ctx.registry.root().to_path_buf();

    // Connecting: validate before a session exists
    let mut requested = None;
    let ws = tungstenite::accept_hdr(stream, |req: &Request, resp: Response| {
        match validate_request(req, &root) {
            Ok(path) => {
                requested = Some(path);
                Ok(resp)
            }
            Err(reject) => {
                crate::debug!("session"; "rejected {}: {}", peer, reject);
                Err(reject.into_response())
            }
        }
    });

    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            crate::debug!("session"; "handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let Some(path) = requested else { return };

    ConnectionSession::start(ws, path, ctx, peer);
}

/// Extract and validate the target file from the handshake request.
fn validate_request(req: &Request, root: &Path) -> Result<WatchedPath, SessionReject> {
    use percent_encoding::percent_decode_str;

    let query = req.uri().query().unwrap_or("");
    let raw = query_param(query, "file").ok_or(SessionReject::MissingParam)?;
    // browsers percent-encode spaces, slashes, and non-ASCII in the query
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .unwrap_or_else(|_| raw.into());
    let path = WatchedPath::new(&decoded)?;
    if !path.resolve(root).is_file() {
        return Err(SessionReject::NotFound(path.to_string()));
    }
    Ok(path)
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

struct ConnectionSession {
    ws: WebSocket<TcpStream>,
    path: WatchedPath,
    subscriber: Subscriber,
    outbox: Receiver<ServerMessage>,
    ctx: Arc<ServeContext>,
    peer: String,
    state: SessionState,
}

impl ConnectionSession {
    fn start(ws: WebSocket<TcpStream>, path: WatchedPath, ctx: Arc<ServeContext>, peer: String) {
        let (subscriber, outbox) = Subscriber::new();
        let mut session = Self {
            ws,
            path,
            subscriber,
            outbox,
            ctx,
            peer,
            state: SessionState::Connecting,
        };

        // Greet while the socket still blocks, then switch to
        // non-blocking for the polling loop.
        if session
            .ws
            .send(Message::Text(ServerMessage::connected().to_json().into()))
            .is_err()
        {
            return;
        }
        if session.ws.get_ref().set_nonblocking(true).is_err() {
            return;
        }

        // Active for the rest of the connection; the guard releases the
        // subscription on every exit path.
        let guard = Subscription::new(
            Arc::clone(&session.ctx.registry),
            session.path.clone(),
            session.subscriber.clone(),
        );
        session.state = SessionState::Active;
        crate::log!("session"; "{} watching {} ({})", session.subscriber.id(), session.path, session.peer);

        session.run();
        drop(guard);
        crate::log!("session"; "{} closed ({})", session.subscriber.id(), session.peer);
    }

    fn run(&mut self) {
        // Immediate cycle so the viewer sees current state without
        // waiting for a file change.
        self.compile_and_deliver();

        while self.state == SessionState::Active {
            if self.subscriber.is_closed() || crate::serve::is_shutdown() {
                self.state = SessionState::Closed;
                break;
            }
            self.poll_viewer();
            self.drain_outbox();
            std::thread::sleep(POLL_INTERVAL);
        }

        self.state = SessionState::Closed;
        let _ = self.ws.close(None);
    }

    /// One compile cycle with this session's options, delivered to this
    /// session only (manual recompiles are per-session, not path-wide).
    fn compile_and_deliver(&mut self) {
        if !deliver_own_cycle(&self.ctx, &self.path, &self.subscriber) {
            self.state = SessionState::Closed;
        }
    }

    /// Non-blocking read of the next viewer message, if any.
    fn poll_viewer(&mut self) {
        match self.ws.read() {
            Ok(Message::Text(text)) => {
                if let Some(msg) = ClientMessage::from_json(&text) {
                    self.handle_options(&msg);
                } else {
                    crate::debug!("session"; "{} sent unrecognized message", self.subscriber.id());
                }
            }
            Ok(Message::Close(_)) => self.state = SessionState::Closed,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                crate::debug!("session"; "{} read error: {}", self.subscriber.id(), e);
                self.state = SessionState::Closed;
            }
        }
    }

    /// Replace this session's options and run exactly one more cycle.
    fn handle_options(&mut self, update: &ClientMessage) {
        if !apply_option_update(&self.ctx, &self.path, &self.subscriber, update) {
            self.state = SessionState::Closed;
        }
    }

    /// Forward queued results (broadcasts and own cycles) to the socket.
    fn drain_outbox(&mut self) {
        while let Ok(msg) = self.outbox.try_recv() {
            if let Err(e) = self.ws.send(Message::Text(msg.to_json().into())) {
                crate::debug!("session"; "{} write failed: {}", self.subscriber.id(), e);
                self.state = SessionState::Closed;
                return;
            }
        }
    }
}

/// One compile cycle with the subscriber's own options, delivered to its
/// outbox alone. Returns false when the subscriber is gone or stalled.
fn deliver_own_cycle(ctx: &ServeContext, path: &WatchedPath, subscriber: &Subscriber) -> bool {
    let options = subscriber.options();
    let result = compile_file(
        ctx.compiler.as_ref(),
        ctx.registry.root(),
        path,
        options.as_ref(),
    );
    subscriber.deliver(ServerMessage::result(&result))
}

/// Merge a viewer's option update onto its session's options, mark the
/// subscriber as the path's current one, and run exactly one more cycle
/// delivered to the issuing subscriber only.
fn apply_option_update(
    ctx: &ServeContext,
    path: &WatchedPath,
    subscriber: &Subscriber,
    update: &ClientMessage,
) -> bool {
    let base = subscriber
        .options()
        .or_else(|| CompileOptions::defaults_for(path.file_name()));

    let merged = match base {
        Some(base) => Some(base.apply(update)),
        // No extension defaults to merge onto: the update must name a
        // recognizable toolchain on its own.
        None => CompileOptions::from_update(update),
    };

    if let Some(options) = merged {
        subscriber.set_options(options);
        ctx.registry.touch(path, subscriber.id());
    }
    deliver_own_cycle(ctx, path, subscriber)
}
