//! Peer identity as reported by the transport layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A remote device seen by the transport.
///
/// Two identifiers, two purposes:
///   - `peer_address` is the transport address (e.g. a radio MAC). Discovery
///     reconciliation compares peers by address only.
///   - `peer_id` is the logical identifier applications use for
///     `connect` / `disconnect`.
///
/// They are not interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub peer_name: String,
    pub peer_address: String,
    /// Optional transport-specific extras (service type, device name, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Peer {
    pub fn new(
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        peer_address: impl Into<String>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            peer_address: peer_address.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach one metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Transport addresses are compared ignoring ASCII case; radios report
    /// MACs in either case.
    pub fn same_address(&self, other: &Peer) -> bool {
        self.has_address(&other.peer_address)
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.peer_address.eq_ignore_ascii_case(address)
    }

    /// Exact `peer_id` match, as used by connect requests.
    pub fn has_id(&self, peer_id: &str) -> bool {
        self.peer_id == peer_id
    }
}
