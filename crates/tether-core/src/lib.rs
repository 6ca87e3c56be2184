//! tether-core — peer identity, outward event payloads, errors, and configuration.
//! All other tether crates depend on this one.

pub mod config;
pub mod error;
pub mod event;
pub mod peer;

pub use error::BridgeError;
pub use event::{ConnectionStatus, PeerAvailability};
pub use peer::Peer;
