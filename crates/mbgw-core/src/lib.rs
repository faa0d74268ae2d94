//! # mbgw-core
//!
//! Shared library for the Modbus-TCP gateway containing the frame codec and
//! the protocol types used by both the gateway and the device simulator.
//!
//! It has no dependencies on sockets, async runtimes, or configuration.
//!
//! # Architecture overview (for beginners)
//!
//! The gateway accepts register reads and writes from HTTP and MQTT callers
//! and forwards them to field devices ("slaves") speaking Modbus-TCP over
//! persistent TCP connections.  This crate defines how those requests look
//! as bytes:
//!
//! - **`protocol::messages`** – function codes, the 7-byte MBAP header,
//!   [`RegisterRequest`] and the interpreted [`Reply`].
//! - **`protocol::codec`** – pure functions that turn requests into frames and
//!   frames back into headers, bodies and replies.
//! - **`protocol::transaction`** – the per-device 16-bit transaction counter.

pub mod protocol;

// Re-export the most-used items at the crate root so callers can write
// `mbgw_core::encode_request` instead of the full module path.
pub use protocol::codec::{
    decode_body, decode_header, decode_request, encode_request, parse_reply, ProtocolError,
};
pub use protocol::messages::{FunctionCode, MbapHeader, RegisterRequest, Reply, UnitId};
pub use protocol::transaction::TransactionCounter;
