//! Bridge session — one raw peer stream exposed as a single-use local TCP port.
//!
//! Lifecycle: Created → Listening → Bridged → Closed. Closed is reachable
//! from every state and is entered exactly once, by the session's own task.
//! Whoever holds the handle can request it with `close()` (or by dropping the
//! handle); the task then releases the raw stream and the local socket and
//! reports `SessionClosed` to its owner.

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use tether_core::Peer;

use crate::transport::BoxedPeerStream;

/// Bytes buffered from the peer before the local client shows up.
const EARLY_DATA_LIMIT: usize = 64 * 1024;

/// Pause after a failed accept (fd exhaustion and the like) before retrying.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Opaque handle identifying a session within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from a remote peer.
    Incoming,
    /// Initiated locally through `connect`.
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Listening,
    Bridged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local TCP client closed or half-closed its side.
    TcpClosed,
    /// Nobody connected to the local port in time.
    BridgeTimeout,
    /// The peer stream reached EOF.
    TransportClosed,
    TransportError(String),
    /// `close()` was called or the handle dropped.
    Explicit,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TcpClosed => f.write_str("local connection closed"),
            CloseReason::BridgeTimeout => f.write_str("no local client connected in time"),
            CloseReason::TransportClosed => f.write_str("peer stream closed"),
            CloseReason::TransportError(e) => write!(f, "peer stream failed: {e}"),
            CloseReason::Explicit => f.write_str("closed locally"),
        }
    }
}

/// Termination notice sent to the session's owner, exactly once.
#[derive(Debug, Clone)]
pub struct SessionClosed {
    pub id: SessionId,
    pub direction: Direction,
    pub local_port: u16,
    pub reason: CloseReason,
}

/// Snapshot of a session for status output.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Peer,
    pub direction: Direction,
    pub local_port: u16,
    pub state: SessionState,
}

/// Handle to a running bridge. Dropping it closes the bridge.
pub struct BridgeSession {
    id: SessionId,
    peer: Peer,
    direction: Direction,
    local_port: u16,
    state: watch::Receiver<SessionState>,
    close_tx: watch::Sender<bool>,
}

impl BridgeSession {
    /// Bind the local port and start bridging in a new task.
    ///
    /// `requested_port` 0 lets the OS pick. Returns once the listener is
    /// accepting; a bind failure drops `stream` and reports nothing to
    /// `on_closed`.
    pub async fn open(
        id: SessionId,
        stream: BoxedPeerStream,
        direction: Direction,
        peer: Peer,
        requested_port: u16,
        accept_timeout: Duration,
        on_closed: mpsc::UnboundedSender<SessionClosed>,
    ) -> std::io::Result<Self> {
        let (state_tx, state) = watch::channel(SessionState::Created);
        let (close_tx, close_rx) = watch::channel(false);

        let listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, requested_port))).await?;
        let local_port = listener.local_addr()?.port();
        state_tx.send_replace(SessionState::Listening);

        tracing::debug!(
            session = %id,
            peer_id = %peer.peer_id,
            ?direction,
            port = local_port,
            "bridge listening"
        );

        let task = SessionTask {
            id,
            direction,
            local_port,
            accept_timeout,
            state_tx,
            close_rx,
            on_closed,
        };
        tokio::spawn(task.run(stream, listener));

        Ok(Self {
            id,
            peer,
            direction,
            local_port,
            state,
            close_tx,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The port actually bound.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: self.peer.clone(),
            direction: self.direction,
            local_port: self.local_port,
            state: self.state(),
        }
    }

    /// Request teardown. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Wait until the session task has released everything.
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

struct SessionTask {
    id: SessionId,
    direction: Direction,
    local_port: u16,
    accept_timeout: Duration,
    state_tx: watch::Sender<SessionState>,
    close_rx: watch::Receiver<bool>,
    on_closed: mpsc::UnboundedSender<SessionClosed>,
}

impl SessionTask {
    async fn run(mut self, stream: BoxedPeerStream, listener: TcpListener) {
        let reason = self.bridge(stream, listener).await;
        // stream, listener and client are all dropped by now
        self.state_tx.send_replace(SessionState::Closed);

        tracing::debug!(session = %self.id, port = self.local_port, %reason, "bridge closed");

        let _ = self.on_closed.send(SessionClosed {
            id: self.id,
            direction: self.direction,
            local_port: self.local_port,
            reason,
        });
    }

    async fn bridge(&mut self, mut stream: BoxedPeerStream, listener: TcpListener) -> CloseReason {
        if *self.close_rx.borrow() {
            return CloseReason::Explicit;
        }
        let id = self.id;
        let listener = &listener;

        // ── Listening ────────────────────────────────────────────────────────
        let deadline = tokio::time::sleep(self.accept_timeout);
        tokio::pin!(deadline);
        let mut early = Vec::new();
        let mut buf = vec![0u8; 8 * 1024];

        let mut client = loop {
            tokio::select! {
                _ = self.close_rx.changed() => return CloseReason::Explicit,

                _ = &mut deadline => return CloseReason::BridgeTimeout,

                (client, from) = accept_retrying(id, move || listener.accept()) => {
                    tracing::debug!(session = %id, %from, "local client connected");
                    break client;
                },

                read = stream.read(&mut buf), if early.len() < EARLY_DATA_LIMIT => match read {
                    Ok(0) => return CloseReason::TransportClosed,
                    Ok(n) => early.extend_from_slice(&buf[..n]),
                    Err(e) => return CloseReason::TransportError(e.to_string()),
                },
            }
        };

        // ── Bridged ──────────────────────────────────────────────────────────
        self.state_tx.send_replace(SessionState::Bridged);

        if !early.is_empty() && client.write_all(&early).await.is_err() {
            return CloseReason::TcpClosed;
        }
        drop(early);

        let (mut peer_rd, mut peer_wr) = tokio::io::split(stream);
        let (mut tcp_rd, mut tcp_wr) = client.split();

        tokio::select! {
            _ = self.close_rx.changed() => CloseReason::Explicit,

            copied = tokio::io::copy(&mut peer_rd, &mut tcp_wr) => match copied {
                Ok(bytes) => {
                    tracing::trace!(session = %self.id, bytes, "peer → local finished");
                    CloseReason::TransportClosed
                }
                Err(e) => CloseReason::TransportError(e.to_string()),
            },

            copied = tokio::io::copy(&mut tcp_rd, &mut peer_wr) => {
                if let Ok(bytes) = copied {
                    tracing::trace!(session = %self.id, bytes, "local → peer finished");
                }
                CloseReason::TcpClosed
            },

            reason = reject_extra_clients(listener, id) => reason,
        }
    }
}

/// Keep the port occupied while bridged, turning away every other client.
async fn reject_extra_clients(listener: &TcpListener, id: SessionId) -> CloseReason {
    loop {
        let (extra, from): (TcpStream, _) = accept_retrying(id, move || listener.accept()).await;
        tracing::debug!(session = %id, %from, "rejecting extra local client");
        drop(extra);
    }
}

/// Accept until one succeeds. Accept errors are transient for a listening
/// socket, so they are logged and retried; the caller's deadline or close
/// request bounds the wait.
async fn accept_retrying<T, F, Fut>(id: SessionId, mut accept: F) -> (T, SocketAddr)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(T, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "local accept failed, retrying");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
}
