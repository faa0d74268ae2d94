//! Application layer use cases for the gateway.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer sits between the protocol codec in `mbgw_core` and
//! the infrastructure (sockets, HTTP, MQTT, files).  Code here:
//!
//! - **Orchestrates** sessions and queues to fulfil a caller's goal (e.g.,
//!   "read register 0 of device 1 and give me the reply").
//! - **Depends on abstractions** ([`manage_devices::DeviceConnector`]) rather
//!   than concrete sockets, so tests run without a network.
//! - **Contains no HTTP or MQTT types.**
//!
//! # Sub-modules
//!
//! - **`session`**          – one connected device: its FIFO queue and the
//!   worker task that owns the socket.
//! - **`device_registry`**  – device id → live session table.
//! - **`route_request`**    – validates a call, enqueues it, waits for the
//!   reply.  Every front-end request passes through here.
//! - **`manage_devices`**   – connect, disconnect, stats.

pub mod device_registry;
pub mod manage_devices;
pub mod route_request;
pub mod session;
