//! Outward events as JSON lines on stdout.

use std::io::Write;

use serde::Serialize;
use serde_json::json;

use tether_core::event::{
    EVENT_CONNECTION_STATUS_UPDATE, EVENT_INCOMING_CONNECTION_FAILED,
    EVENT_PEER_AVAILABILITY_CHANGED,
};
use tether_core::{ConnectionStatus, PeerAvailability};
use tether_services::EventSink;

pub struct JsonLinesSink;

impl JsonLinesSink {
    fn emit(&self, event: &str, data: impl Serialize) {
        let line = json!({ "event": event, "data": data });
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            tracing::warn!(error = %e, event, "failed to write event");
        }
    }
}

impl EventSink for JsonLinesSink {
    fn peer_availability_changed(&self, batch: Vec<PeerAvailability>) {
        self.emit(EVENT_PEER_AVAILABILITY_CHANGED, batch);
    }

    fn connection_status_update(&self, peer_id: &str, status: ConnectionStatus) {
        self.emit(
            EVENT_CONNECTION_STATUS_UPDATE,
            json!({ "peerIdentifier": peer_id, "error": status.error, "port": status.port }),
        );
    }

    fn incoming_connection_failed(&self, port: u16) {
        self.emit(EVENT_INCOMING_CONNECTION_FAILED, json!({ "port": port }));
    }
}
