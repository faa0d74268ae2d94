//! Infrastructure layer for the gateway.
//!
//! Contains the adapters around the application layer: TCP dialing, the
//! HTTP API, the MQTT bridge and configuration-file storage.
//!
//! **Dependency rule**: this layer may depend on `application` and `mbgw_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod http_api;
pub mod mqtt_bridge;
pub mod network;
pub mod payload;
pub mod storage;
