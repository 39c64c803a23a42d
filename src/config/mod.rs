//! Service Configuration Module
//!
//! TOML-backed settings for the server, storage, rolling buffer, trial
//! lifecycle and ingest limits.
//!
//! ## Loading Order
//!
//! 1. `VITALSTREAM_CONFIG` environment variable (path to TOML file)
//! 2. `vitalstream.toml` in the current working directory
//! 3. Built-in defaults (see `defaults`)
//!
//! CLI flags override individual values after loading. The resolved config
//! is passed explicitly to `TelemetryService`; there is no global instance.

mod service_config;
pub mod defaults;
pub mod validation;

pub use service_config::*;
