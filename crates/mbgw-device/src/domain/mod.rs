//! Domain types for the simulated device.

pub mod register_bank;

pub use register_bank::RegisterBank;
