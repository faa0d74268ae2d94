//! Application layer for the simulated device.
//!
//! - **`process_request`** – the device's whole protocol behaviour: one
//!   request frame in, at most one reply frame out.

pub mod process_request;

pub use process_request::process_request;
