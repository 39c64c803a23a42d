//! VitalStream: live medical telemetry and trial recording
//!
//! Devices stream sensor readings over WebSocket. Every reading lands in a
//! bounded per-patient rolling buffer for live display; while a patient has
//! an active trial, readings are also appended to a durable trial log that
//! is finalized into one columnar record when the trial ends.
//!
//! ## Architecture
//!
//! - **Connection Registry**: one live stream per patient, last writer wins
//! - **Rolling Buffer Store**: capacity- and age-bounded live readings
//! - **Trial State Machine**: per-patient start/end lifecycle
//! - **Trial Accumulator**: sequence-numbered durable trial log
//! - **Trial Finalizer**: log -> `FinalizedTrialRecord` with summary stats
//! - **Ingestion Gateway**: validates readings and routes them

pub mod api;
pub mod background;
pub mod config;
pub mod device;
pub mod gateway;
pub mod registry;
pub mod rolling_buffer;
pub mod service;
pub mod storage;
pub mod trials;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, ServiceConfig};

// Re-export commonly used types
pub use types::{
    FinalizedTrialRecord, ParameterStats, PatientId, Reading, ReadingAck, SensorValue, Trial,
    TrialId, TrialLogEntry, TrialStatus,
};

// Re-export components
pub use gateway::{IngestError, IngestionGateway};
pub use registry::ConnectionRegistry;
pub use rolling_buffer::RollingBufferStore;
pub use service::TelemetryService;
pub use storage::{InMemoryTrialStore, SledTrialStore, StoreError, TrialStore};
pub use trials::{TrialAccumulator, TrialError, TrialFinalizer, TrialStateMachine};
