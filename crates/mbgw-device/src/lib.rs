//! mbgw-device library entry point.
//!
//! A simulated Modbus-TCP device: it listens for connections, answers
//! Read Holding Registers (0x03) and Write Multiple Registers (0x10) from an
//! in-memory register bank, and reports everything else as an exception.
//!
//! - **`domain`**         – the register bank.
//! - **`application`**    – turns one request frame into one reply frame.
//! - **`infrastructure`** – the TCP listener and the single request worker.

pub mod application;
pub mod domain;
pub mod infrastructure;
