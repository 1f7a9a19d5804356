//! Error types for the virtual ECU.

use thiserror::Error;

/// Errors that can terminate startup or surface from the CAN transport.
#[derive(Debug, Error)]
pub enum EcuError {
    #[error("failed to open CAN interface {interface}: {source}")]
    ChannelOpen {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure CAN socket: {0}")]
    ChannelConfig(std::io::Error),

    #[error("CAN send failed: {0}")]
    Send(std::io::Error),

    #[error("CAN receive failed: {0}")]
    Recv(std::io::Error),
}

pub type Result<T> = std::result::Result<T, EcuError>;
