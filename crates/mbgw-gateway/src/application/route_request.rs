//! RouteRequestUseCase: hand a register request to the right device queue and
//! wait for its reply.
//!
//! Both front-ends (HTTP and MQTT) go through [`RequestRouter`].  Routing is
//! split into two steps so callers can observe queue order:
//!
//! - [`RequestRouter::enqueue`] validates the call, finds the session and
//!   appends the request to its FIFO queue.  It never waits.
//! - [`PendingReply::wait`] waits (bounded) for the worker to answer.
//!
//! A caller that times out simply stops listening.  The worker still
//! finishes the exchange so the next request never reads a stale reply.

use std::sync::Arc;
use std::time::Duration;

use mbgw_core::{FunctionCode, RegisterRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use super::device_registry::DeviceRegistry;
use super::session::PendingRequest;
use crate::{DeviceId, GatewayError};

/// Default bound on how long a caller waits for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A register request addressed to a device, as received from a front-end.
///
/// `function_code` is kept raw so unsupported codes can be rejected with
/// [`GatewayError::UnsupportedFunction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusCall {
    pub device_id: DeviceId,
    pub function_code: u8,
    pub address: u16,
    pub quantity: u16,
    #[serde(default)]
    pub values: Vec<u16>,
}

impl ModbusCall {
    pub fn read(device_id: DeviceId, address: u16, quantity: u16) -> Self {
        Self {
            device_id,
            function_code: FunctionCode::ReadHoldingRegisters.code(),
            address,
            quantity,
            values: Vec::new(),
        }
    }

    /// A write whose quantity equals the number of values.
    pub fn write(device_id: DeviceId, address: u16, values: Vec<u16>) -> Self {
        Self {
            device_id,
            function_code: FunctionCode::WriteMultipleRegisters.code(),
            address,
            quantity: values.len() as u16,
            values,
        }
    }

    /// Converts to a codec request, checking function code and framability.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnsupportedFunction`] for codes other than 0x03/0x10.
    /// - [`GatewayError::InvalidRequest`] for a write that cannot be framed.
    pub fn to_request(&self) -> Result<RegisterRequest, GatewayError> {
        let function = FunctionCode::try_from(self.function_code)
            .map_err(|_| GatewayError::UnsupportedFunction(self.function_code))?;
        let request = RegisterRequest {
            function,
            address: self.address,
            quantity: self.quantity,
            values: match function {
                FunctionCode::ReadHoldingRegisters => Vec::new(),
                FunctionCode::WriteMultipleRegisters => self.values.clone(),
            },
        };
        request.validate()?;
        Ok(request)
    }
}

// ── PendingReply ──────────────────────────────────────────────────────────────

/// The caller's side of an enqueued request.
#[derive(Debug)]
pub struct PendingReply {
    device_id: DeviceId,
    rx: oneshot::Receiver<Result<Vec<u8>, GatewayError>>,
}

impl PendingReply {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Waits up to `timeout` for the raw reply ADU.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Timeout`] if no reply arrives in time.
    /// - [`GatewayError::ConnectionClosed`] if the session ended first.
    /// - Whatever error the worker reported for this request.
    pub async fn wait(self, timeout: Duration) -> Result<Vec<u8>, GatewayError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed(self.device_id)),
            Err(_) => {
                debug!(device_id = self.device_id, ?timeout, "caller gave up waiting");
                Err(GatewayError::Timeout {
                    device_id: self.device_id,
                    waited: timeout,
                })
            }
        }
    }
}

// ── RequestRouter ─────────────────────────────────────────────────────────────

pub struct RequestRouter {
    registry: Arc<DeviceRegistry>,
    default_timeout: Duration,
}

impl RequestRouter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Validates `call` and appends it to the device's queue.
    ///
    /// Validation happens before lookup, so a bad function code is reported
    /// as such even for an unknown device.
    ///
    /// # Errors
    ///
    /// [`GatewayError::UnsupportedFunction`], [`GatewayError::InvalidRequest`],
    /// [`GatewayError::DeviceNotConnected`] or [`GatewayError::QueueFull`].
    pub fn enqueue(&self, call: &ModbusCall) -> Result<PendingReply, GatewayError> {
        let request = call.to_request()?;
        let session = self.registry.lookup(call.device_id)?;

        let (tx, rx) = oneshot::channel();
        session.try_enqueue(PendingRequest { request, reply: tx })?;

        Ok(PendingReply {
            device_id: call.device_id,
            rx,
        })
    }

    /// Enqueues `call` and waits up to `timeout` for the reply.
    pub async fn submit(
        &self,
        call: &ModbusCall,
        timeout: Duration,
    ) -> Result<Vec<u8>, GatewayError> {
        self.enqueue(call)?.wait(timeout).await
    }

    /// [`Self::submit`] with the router's default timeout.
    pub async fn submit_default(&self, call: &ModbusCall) -> Result<Vec<u8>, GatewayError> {
        self.submit(call, self.default_timeout).await
    }
}
