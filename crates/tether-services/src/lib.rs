//! tether-services — discovery reconciliation and the TCP bridge manager.

pub mod bridge;
pub mod manager;
pub mod registry;
pub mod sink;
pub mod transport;

pub use bridge::{BridgeSession, CloseReason, Direction, SessionId, SessionInfo, SessionState};
pub use manager::{ConnectionManager, PendingConnection, StartOptions};
pub use registry::{AvailabilityDelta, PeerRegistry};
pub use sink::{ChannelSink, EventSink, SinkEvent};
pub use transport::{
    BoxedPeerStream, PeerStream, Transport, TransportError, TransportEvents, TransportStart,
    TransportState, TryConnect,
};
