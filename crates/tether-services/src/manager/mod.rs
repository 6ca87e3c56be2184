//! Connection manager — owns every bridge session and the peer registry.
//!
//! All state lives in one task (`actor::ManagerActor`). The cloneable
//! `ConnectionManager` handle and the transport's `TransportEvents` both feed
//! its command queue, so registry updates, session bookkeeping and connect
//! requests are serialized without locks. Sessions report their own
//! termination back on a channel; removal is keyed by `SessionId` and a
//! second removal of the same id is a no-op.

mod actor;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use tether_core::config::BridgeConfig;
use tether_core::{BridgeError, ConnectionStatus, Peer};

use crate::bridge::SessionInfo;
use crate::sink::EventSink;
use crate::transport::{Transport, TransportEvent};

/// Arguments to `start`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Local port incoming bridges listen on. 0 = OS-assigned per session.
    pub server_port: u16,
    /// Also advertise and accept incoming connections.
    pub advertise: bool,
}

pub(crate) enum Command {
    Start {
        options: StartOptions,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    StopListening {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Connect {
        peer_id: String,
        reply: oneshot::Sender<Result<PendingConnection, BridgeError>>,
    },
    Disconnect {
        peer_id: String,
        reply: oneshot::Sender<bool>,
    },
    KillAll {
        reply: oneshot::Sender<usize>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    IsRunning {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Transport(TransportEvent),
}

/// A connect request the transport accepted. Resolves once, to the bridged
/// local port or the reason it failed.
#[derive(Debug)]
pub struct PendingConnection {
    peer_id: String,
    rx: oneshot::Receiver<Result<u16, BridgeError>>,
}

impl PendingConnection {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Wait for the outcome. `Cancelled` if the manager dropped the request.
    pub async fn port(self) -> Result<u16, BridgeError> {
        self.rx.await.unwrap_or(Err(BridgeError::Cancelled))
    }
}

/// Cheap, cloneable handle to the manager task.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    /// Spawn the manager task. It runs until `shutdown` or until every handle
    /// (and the transport's event handle) is dropped.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        config: BridgeConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = actor::ManagerActor::new(transport, sink, config, rx, tx.downgrade());
        let task = tokio::spawn(actor.run());
        (Self { tx }, task)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).ok()?;
        rx.await.ok()
    }

    /// Bring the transport up. Succeeds without side effects when already
    /// running, except that it switches on advertising or discovery if they
    /// are requested and currently off.
    pub async fn start(&self, options: StartOptions) -> Result<(), BridgeError> {
        self.request(|reply| Command::Start { options, reply })
            .await
            .unwrap_or(Err(BridgeError::NotStarted))
    }

    /// Stop discovery only. Sessions are untouched.
    pub async fn stop_listening(&self) {
        self.request(|reply| Command::StopListening { reply }).await;
    }

    /// Close every session and stop the transport. Always converges to stopped.
    pub async fn stop(&self) {
        self.request(|reply| Command::Stop { reply }).await;
    }

    /// Ask the transport to connect to `peer_id`.
    ///
    /// Errors that can be decided immediately come back as `Err`; otherwise
    /// the returned `PendingConnection` resolves later.
    pub async fn connect(&self, peer_id: &str) -> Result<PendingConnection, BridgeError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::Connect { peer_id, reply })
            .await
            .unwrap_or(Err(BridgeError::NotStarted))
    }

    /// Callback form of `connect`: `callback` is invoked exactly once with the
    /// terminal status, unless the request is cancelled, in which case it is
    /// dropped without being called.
    pub async fn connect_with<F>(&self, peer_id: &str, callback: F)
    where
        F: FnOnce(ConnectionStatus) + Send + 'static,
    {
        match self.connect(peer_id).await {
            Err(e) => callback(ConnectionStatus::failed(e)),
            Ok(pending) => {
                let peer_id = pending.peer_id().to_string();
                tokio::spawn(async move {
                    match pending.port().await {
                        Err(BridgeError::Cancelled) => {
                            tracing::debug!(%peer_id, "connect cancelled, dropping callback");
                        }
                        result => callback(result.into()),
                    }
                });
            }
        }
    }

    /// Close the outgoing session if `peer_id` is empty or names its peer.
    /// Incoming sessions are never affected.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::Disconnect { peer_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Close every session, outgoing and incoming, while staying running.
    /// Returns how many were closed.
    pub async fn kill_all_connections(&self) -> usize {
        self.request(|reply| Command::KillAll { reply })
            .await
            .unwrap_or(0)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.request(|reply| Command::Sessions { reply })
            .await
            .unwrap_or_default()
    }

    /// Currently available peers.
    pub async fn peers(&self) -> Vec<Peer> {
        self.request(|reply| Command::Peers { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn is_running(&self) -> bool {
        self.request(|reply| Command::IsRunning { reply })
            .await
            .unwrap_or(false)
    }

    /// Stop and end the manager task.
    pub async fn shutdown(&self) {
        self.request(|reply| Command::Shutdown { reply }).await;
    }
}
