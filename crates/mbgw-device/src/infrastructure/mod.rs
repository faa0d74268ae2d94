//! Infrastructure layer for the simulated device.
//!
//! - **`server`** – TCP listener, per-connection framing, and the single
//!   worker that owns the register bank.

pub mod server;

pub use server::{DeviceSimulator, SimulatorConfig, SimulatorError};
