//! Error taxonomy for the bridge core.
//!
//! Display strings double as the error messages relayed to application
//! code through `ConnectionStatus`, so they read as sentences.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Operation requires the manager to be running.
    #[error("Device connectivity not started, please call start before attempting to connect")]
    NotStarted,

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("There is already one connection attempt progressing.")]
    AlreadyAttemptingToConnect,

    #[error("Device Address for {0} not found from Discovered device list.")]
    PeerNotFound(String),

    /// The transport could not select the device it was handed.
    #[error("Device Address for {0} not found from Discovered device list.")]
    NoSelectedDevice(String),

    #[error("Transport failed to get device for the address : {0}")]
    DeviceFetchFailed(String),

    #[error("Unspecified Error with Radio infrastructure: {0}")]
    RadioUnspecifiedError(String),

    #[error("Connection to {0} failed")]
    ConnectionFailed(String),

    /// The remote never completed the connection in time.
    #[error("Connection wait timed out for {0}")]
    ConnectTimeout(String),

    /// No local TCP client connected to the bridged port in time.
    #[error("No client connected to bridge port {0} in time")]
    BridgeTimeout(u16),

    /// The request was superseded or the manager stopped before it resolved.
    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("failed to bind bridge port: {0}")]
    Bind(#[from] std::io::Error),
}

impl BridgeError {
    /// True for failures the caller may reasonably retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::AlreadyAttemptingToConnect
                | BridgeError::DeviceFetchFailed(_)
                | BridgeError::RadioUnspecifiedError(_)
                | BridgeError::ConnectionFailed(_)
                | BridgeError::ConnectTimeout(_)
        )
    }
}
