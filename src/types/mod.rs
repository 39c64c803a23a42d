//! Shared data structures for live telemetry and trial recording
//!
//! - `reading`: device readings and the tagged sensor value type
//! - `trial`: trial rows, trial log entries and the finalized trial record

mod reading;
mod trial;

pub use reading::*;
pub use trial::*;

/// Patient identifier as carried in the stream URL and payloads.
pub type PatientId = i64;

/// Trial identifier, allocated monotonically by the trial store.
pub type TrialId = u64;
