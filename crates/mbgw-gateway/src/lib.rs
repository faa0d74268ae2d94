//! mbgw-gateway library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # Layering (for beginners)
//!
//! - **`application`** – device sessions, the registry, request routing and
//!   the connect/disconnect use case.  No HTTP or MQTT types appear here.
//! - **`infrastructure`** – adapters: TCP dialing, the axum HTTP API, the
//!   rumqttc bridge and the TOML configuration file.
//! - **`error`** – the single [`GatewayError`] every layer reports through.

pub mod application;
pub mod error;
pub mod infrastructure;

pub use error::GatewayError;

/// Identifies a connected device; doubles as the Modbus unit id on the wire.
pub type DeviceId = mbgw_core::UnitId;
