//! TcpConnector: dials devices over plain TCP.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::application::manage_devices::{DeviceConnector, DialedDevice};

/// Bound on the TCP handshake so an unroutable host fails fast.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl DeviceConnector for TcpConnector {
    async fn dial(&self, host: &str, port: u16) -> io::Result<DialedDevice> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", self.connect_timeout),
                )
            })??;

        // Request frames are small; send them without Nagle delay.
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{host}:{port}"));
        debug!(%peer, "dialed device");

        Ok(DialedDevice {
            stream: Box::new(stream),
            peer,
        })
    }
}
