//! Network infrastructure for the gateway.
//!
//! # Sub-modules
//!
//! - **`tcp_connector`** – the [`crate::application::manage_devices::DeviceConnector`]
//!   used in production: dials `host:port`, disables Nagle, records the peer.

pub mod tcp_connector;

pub use tcp_connector::TcpConnector;
