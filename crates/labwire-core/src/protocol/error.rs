//! Protocol errors

use thiserror::Error;

use super::format_hex;

/// Errors raised while building a request frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload of {0} bytes does not fit the byte-count field")]
    PayloadTooLarge(usize),
}

/// Errors at the OS/driver level of a serial link
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::SerialError(e.to_string())
    }
}

/// Errors from connecting, discovery and session management
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No device found after {attempts} attempts (last response: {})", last_response_hex(.last_response))]
    NoDeviceFound {
        attempts: usize,
        last_response: Option<Vec<u8>>,
    },

    #[error("No device answered on any of {candidates:?}")]
    PortNotFound { candidates: Vec<String> },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection attempt already in progress")]
    ProbeInProgress,

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Invalid connection parameters: {0}")]
    InvalidParameters(String),
}

fn last_response_hex(raw: &Option<Vec<u8>>) -> String {
    match raw {
        Some(bytes) if !bytes.is_empty() => format_hex(bytes),
        _ => "none".to_string(),
    }
}
