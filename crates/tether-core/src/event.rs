//! Outward event payloads.
//!
//! These are what the dispatch layer relays to application code, so the
//! serialized field names follow its vocabulary rather than Rust naming.

use serde::{Deserialize, Serialize};

use crate::peer::Peer;

/// Event name for batched availability changes.
pub const EVENT_PEER_AVAILABILITY_CHANGED: &str = "peerAvailabilityChanged";
/// Event name for connect progress/outcome.
pub const EVENT_CONNECTION_STATUS_UPDATE: &str = "connectionStatusUpdate";
/// Event name for an incoming bridge that could not be served locally.
pub const EVENT_INCOMING_CONNECTION_FAILED: &str = "incomingConnectionToPortNumberFailed";

/// Port value reported alongside an error.
pub const NO_PORT: i32 = -1;

/// One entry of a `peerAvailabilityChanged` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAvailability {
    pub peer_identifier: String,
    pub peer_name: String,
    pub peer_available: bool,
}

impl PeerAvailability {
    pub fn available(peer: &Peer) -> Self {
        Self::of(peer, true)
    }

    pub fn unavailable(peer: &Peer) -> Self {
        Self::of(peer, false)
    }

    fn of(peer: &Peer, available: bool) -> Self {
        Self {
            peer_identifier: peer.peer_id.clone(),
            peer_name: peer.peer_name.clone(),
            peer_available: available,
        }
    }
}

/// Terminal status of a connect request: either an error message or the
/// bridged local port, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub error: Option<String>,
    pub port: i32,
}

impl ConnectionStatus {
    pub fn ready(port: u16) -> Self {
        Self {
            error: None,
            port: i32::from(port),
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            port: NO_PORT,
        }
    }

    /// The bridged port, if the connect succeeded.
    pub fn port(&self) -> Option<u16> {
        match self.error {
            Some(_) => None,
            None => u16::try_from(self.port).ok(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl<E: ToString> From<Result<u16, E>> for ConnectionStatus {
    fn from(result: Result<u16, E>) -> Self {
        match result {
            Ok(port) => Self::ready(port),
            Err(e) => Self::failed(e),
        }
    }
}
