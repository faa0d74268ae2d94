//! ManageDevicesUseCase: connect to and disconnect from devices.
//!
//! The gateway dials out to each device ("slave") on request; there is no
//! listener for devices.  Dialing goes through the [`DeviceConnector`] trait
//! so tests can hand the use case an in-memory stream instead of a socket.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::device_registry::DeviceRegistry;
use super::session::{DeviceStats, SessionConfig};
use crate::{DeviceId, GatewayError};

/// Any byte stream a session can run over.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DeviceIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An established connection to a device.
pub struct DialedDevice {
    pub stream: Box<dyn DeviceIo>,
    /// Remote address, used for stats and logs.
    pub peer: String,
}

/// Opens connections to devices.
///
/// Infrastructure implementation dials TCP; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<DialedDevice>;
}

pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
    connector: Arc<dyn DeviceConnector>,
    session_config: SessionConfig,
}

impl DeviceManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connector: Arc<dyn DeviceConnector>,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            session_config,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Dials `host:port` and registers the connection as `device_id`.
    ///
    /// The id is checked before dialing so a duplicate connect never opens
    /// a second socket; it is checked again at registration in case another
    /// connect for the same id won the race.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Conflict`] if the id is already connected.
    /// - [`GatewayError::ConnectionFailed`] if dialing fails.
    pub async fn connect(
        &self,
        device_id: DeviceId,
        host: &str,
        port: u16,
    ) -> Result<DeviceStats, GatewayError> {
        if self.registry.contains(device_id) {
            return Err(GatewayError::Conflict(device_id));
        }

        let addr = format!("{host}:{port}");
        let dialed = self.connector.dial(host, port).await.map_err(|source| {
            warn!(device_id, %addr, "connect failed: {source}");
            GatewayError::ConnectionFailed {
                addr: addr.clone(),
                source,
            }
        })?;

        let session = self.registry.register(
            device_id,
            dialed.stream,
            dialed.peer,
            &self.session_config,
        )?;
        info!(device_id, peer = session.peer(), "device connected");
        Ok(session.stats())
    }

    /// Closes the device's connection.  Returns `false` if it was not
    /// connected.
    pub fn disconnect(&self, device_id: DeviceId) -> bool {
        self.registry.unregister(device_id)
    }

    pub fn stats(&self) -> Vec<DeviceStats> {
        self.registry.snapshot()
    }
}
