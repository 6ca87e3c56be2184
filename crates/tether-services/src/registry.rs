//! Peer registry — the last-known-available peer set.
//!
//! Two entry points write into the same retained set:
//!   - `reconcile` diffs a full discovery snapshot against it and is the only
//!     path that ever reports a peer as unavailable.
//!   - `observe` records a single peer as soon as it is seen (discovery or an
//!     inbound connection) and only ever reports availability.
//!
//! The registry is a plain value; the connection manager owns it inside its
//! task, so both paths are serialized by construction.

use tether_core::{Peer, PeerAvailability};

/// Availability changes produced by one registry update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityDelta {
    pub available: Vec<Peer>,
    pub unavailable: Vec<Peer>,
}

impl AvailabilityDelta {
    pub fn is_empty(&self) -> bool {
        self.available.is_empty() && self.unavailable.is_empty()
    }

    /// Flatten into one outward batch: availables first, then unavailables.
    pub fn to_events(&self) -> Vec<PeerAvailability> {
        self.available
            .iter()
            .map(PeerAvailability::available)
            .chain(self.unavailable.iter().map(PeerAvailability::unavailable))
            .collect()
    }
}

/// Retained peers, unique by transport address, in the order last reported.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    retained: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff a discovery snapshot against the retained set.
    ///
    /// `None` and an empty snapshot both mean "nothing visible". Afterwards the
    /// retained set is exactly the snapshot's peers (first occurrence wins when
    /// the snapshot repeats an address).
    pub fn reconcile(&mut self, snapshot: Option<&[Peer]>) -> AvailabilityDelta {
        let snapshot = snapshot.unwrap_or(&[]);
        let mut previous = std::mem::take(&mut self.retained);
        let mut delta = AvailabilityDelta::default();

        for peer in snapshot {
            if self.retained.iter().any(|p| p.same_address(peer)) {
                continue;
            }
            match previous.iter().position(|p| p.same_address(peer)) {
                // still present
                Some(idx) => {
                    previous.swap_remove(idx);
                }
                None => delta.available.push(peer.clone()),
            }
            self.retained.push(peer.clone());
        }

        delta.unavailable = previous;
        delta
    }

    /// Record a single peer. Returns true if its address was not retained,
    /// i.e. it just became available.
    pub fn observe(&mut self, peer: Peer) -> bool {
        if self.contains_address(&peer.peer_address) {
            return false;
        }
        self.retained.push(peer);
        true
    }

    pub fn find_by_id(&self, peer_id: &str) -> Option<&Peer> {
        self.retained.iter().find(|p| p.has_id(peer_id))
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.retained.iter().any(|p| p.has_address(address))
    }

    pub fn peers(&self) -> &[Peer] {
        &self.retained
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    /// Forget everything without reporting anything.
    pub fn clear(&mut self) {
        self.retained.clear();
    }
}
