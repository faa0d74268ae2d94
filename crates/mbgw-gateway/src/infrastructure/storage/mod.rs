//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the gateway's TOML file and falls back to
//! defaults when the file does not exist, so the gateway starts with no
//! configuration at all.

pub mod config;
