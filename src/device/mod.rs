//! Simulated bedside device
//!
//! - `vitals`: synthetic vital-sign generator
//! - `backoff`: reconnect delay policy
//! - `streamer`: WebSocket client that streams readings and reads acks

pub mod backoff;
pub mod streamer;
pub mod vitals;

pub use backoff::ReconnectPolicy;
pub use streamer::{DeviceStreamer, StreamStats, StreamerConfig};
pub use vitals::VitalsGenerator;
