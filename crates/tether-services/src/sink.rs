//! Outward event sink.

use tokio::sync::mpsc;

use tether_core::{ConnectionStatus, PeerAvailability};

/// Receives everything the manager reports to application code.
pub trait EventSink: Send + Sync + 'static {
    /// One batch per registry update; never called with an empty batch.
    fn peer_availability_changed(&self, batch: Vec<PeerAvailability>);

    /// Terminal outcome of a connect request.
    fn connection_status_update(&self, peer_id: &str, status: ConnectionStatus);

    /// An incoming bridge could not be served on `port`.
    fn incoming_connection_failed(&self, port: u16);
}

/// Sink events as values, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    PeerAvailabilityChanged(Vec<PeerAvailability>),
    ConnectionStatusUpdate {
        peer_id: String,
        status: ConnectionStatus,
    },
    IncomingConnectionFailed(u16),
}

/// Forwards every event into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn peer_availability_changed(&self, batch: Vec<PeerAvailability>) {
        self.forward(SinkEvent::PeerAvailabilityChanged(batch));
    }

    fn connection_status_update(&self, peer_id: &str, status: ConnectionStatus) {
        self.forward(SinkEvent::ConnectionStatusUpdate {
            peer_id: peer_id.to_string(),
            status,
        });
    }

    fn incoming_connection_failed(&self, port: u16) {
        self.forward(SinkEvent::IncomingConnectionFailed(port));
    }
}
