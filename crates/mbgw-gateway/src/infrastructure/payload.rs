//! The JSON request shape shared by the HTTP and MQTT front-ends.
//!
//! ```json
//! {"slave_id": 1, "request": {"function_code": 3, "address": 0, "length": 1}}
//! {"slave_id": 1, "request": {"function_code": 16, "address": 0, "length": 2, "values": [7, 8]}}
//! ```
//!
//! `length` is the register count.  For writes it must equal the number of
//! `values`; the router rejects a mismatch.

use mbgw_core::{parse_reply, Reply};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::application::route_request::ModbusCall;
use crate::{DeviceId, GatewayError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusPayload {
    pub slave_id: DeviceId,
    pub request: PayloadRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRequest {
    pub function_code: u8,
    pub address: u16,
    #[serde(default)]
    pub length: u16,
    #[serde(default)]
    pub values: Vec<u16>,
}

impl ModbusPayload {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the JSON is malformed or
    /// a field is missing or out of range.
    pub fn from_json(bytes: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid JSON payload: {e}")))
    }

    pub fn into_call(self) -> ModbusCall {
        ModbusCall {
            device_id: self.slave_id,
            function_code: self.request.function_code,
            address: self.request.address,
            quantity: self.request.length,
            values: self.request.values,
        }
    }
}

/// Logs a Modbus exception reply.  The reply itself is still returned to
/// the caller unchanged.
pub fn log_device_exception(device_id: DeviceId, reply: &[u8]) {
    if let Ok(Reply::Exception { function, code }) = parse_reply(reply) {
        warn!(
            device_id,
            "device answered function 0x{function:02X} with exception 0x{code:02X}"
        );
    }
}
