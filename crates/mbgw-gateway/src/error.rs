//! Error type shared by every gateway layer.
//!
//! Each variant corresponds to one failure a caller can observe.  The HTTP
//! adapter maps them onto status codes and the MQTT bridge logs them.

use std::io;
use std::time::Duration;

use mbgw_core::ProtocolError;
use thiserror::Error;

use crate::DeviceId;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("device {0} is not connected")]
    DeviceNotConnected(DeviceId),

    #[error("device {0} is already connected")]
    Conflict(DeviceId),

    #[error("unsupported function code 0x{0:02X}")]
    UnsupportedFunction(u8),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request queue for device {0} is full")]
    QueueFull(DeviceId),

    #[error("device {device_id} did not reply within {waited:?}")]
    Timeout { device_id: DeviceId, waited: Duration },

    #[error("I/O error talking to device {device_id}: {source}")]
    Io {
        device_id: DeviceId,
        #[source]
        source: io::Error,
    },

    /// The device sent a frame the gateway cannot split.  The session is
    /// kept open.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transaction id mismatch: sent {expected}, device replied with {received}")]
    TransactionMismatch { expected: u16, received: u16 },

    #[error("failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The session ended before a reply was produced.
    #[error("connection to device {0} closed")]
    ConnectionClosed(DeviceId),
}

impl From<ProtocolError> for GatewayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedFunction(code) => Self::UnsupportedFunction(code),
            ProtocolError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            ProtocolError::MalformedFrame(msg) => Self::MalformedFrame(msg),
            e @ ProtocolError::InsufficientData { .. } => Self::MalformedFrame(e.to_string()),
        }
    }
}
