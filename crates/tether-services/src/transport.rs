//! The transport collaborator — whatever actually talks to the radio.
//!
//! The manager drives it through the `Transport` trait and receives its
//! callbacks through a `TransportEvents` handle, which feeds the same
//! command queue as the public API.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use tether_core::Peer;

use crate::manager::Command;

/// A raw bidirectional byte stream to a peer (e.g. an RFCOMM socket).
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedPeerStream = Box<dyn PeerStream>;

/// Immediate answer to `try_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryConnect {
    /// Attempt is underway; the outcome arrives as `connected` or
    /// `connection_failed`.
    Connecting,
    NoSelectedDevice,
    AlreadyAttemptingToConnect,
    DeviceFetchFailed,
}

/// Advisory transport state. Logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotInitialized,
    WaitingForServices,
    Idle,
    FindingPeers,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no native non-TCP support")]
    Unsupported,
    #[error("radio turned off")]
    RadioOff,
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Options for `Transport::start`.
#[derive(Debug, Clone)]
pub struct TransportStart {
    /// Advertise our presence and accept incoming links.
    pub advertise: bool,
}

/// Operations the manager needs from the radio layer.
///
/// Every method is called from the manager task and must return promptly;
/// long-running work (scanning, dialing) belongs in the transport's own tasks.
pub trait Transport: Send + Sync + 'static {
    /// Bring the transport up. `events` stays valid until `stop`.
    fn start(&self, options: TransportStart, events: TransportEvents) -> Result<(), TransportError>;

    /// Tear everything down. Failures are logged by the caller, never fatal.
    fn stop(&self) -> Result<(), TransportError>;

    fn start_discovery(&self) -> Result<(), TransportError>;
    fn stop_discovery(&self) -> Result<(), TransportError>;

    fn start_advertising(&self) -> Result<(), TransportError>;
    fn stop_advertising(&self) -> Result<(), TransportError>;

    fn try_connect(&self, peer: &Peer) -> TryConnect;
}

/// Callback surface handed to the transport.
#[derive(Clone)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<Command>,
}

/// What a transport reports back.
pub enum TransportEvent {
    /// Full list of currently visible peers. `None` = nothing visible.
    PeerSnapshot(Option<Vec<Peer>>),
    PeerSeen(Peer),
    Connected {
        stream: BoxedPeerStream,
        incoming: bool,
        peer: Peer,
    },
    ConnectionFailed(Peer),
    StateChanged(TransportState),
}

impl TransportEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    fn send(&self, event: TransportEvent) {
        if self.tx.send(Command::Transport(event)).is_err() {
            tracing::debug!("connection manager gone, dropping transport event");
        }
    }

    pub fn peer_snapshot(&self, peers: Option<Vec<Peer>>) {
        self.send(TransportEvent::PeerSnapshot(peers));
    }

    pub fn peer_seen(&self, peer: Peer) {
        self.send(TransportEvent::PeerSeen(peer));
    }

    pub fn connected(&self, stream: impl PeerStream, incoming: bool, peer: Peer) {
        self.send(TransportEvent::Connected {
            stream: Box::new(stream),
            incoming,
            peer,
        });
    }

    pub fn connection_failed(&self, peer: Peer) {
        self.send(TransportEvent::ConnectionFailed(peer));
    }

    pub fn state_changed(&self, state: TransportState) {
        self.send(TransportEvent::StateChanged(state));
    }

    /// True once the manager task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
