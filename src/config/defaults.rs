//! System-wide default constants.
//!
//! Grouped by subsystem. Every value here can be overridden from
//! `vitalstream.toml` unless noted otherwise.

// ============================================================================
// Server
// ============================================================================

/// HTTP / WebSocket bind address.
pub const SERVER_ADDR: &str = "0.0.0.0:8080";

// ============================================================================
// Storage
// ============================================================================

/// Directory holding the sled database.
pub const DATA_DIR: &str = "./data/vitalstream";

// ============================================================================
// Rolling Buffer
// ============================================================================

/// Readings kept per patient for live display.
///
/// 60 readings at 1 Hz = 1 minute of recent vitals.
pub const ROLLING_BUFFER_CAPACITY: usize = 60;

/// Age after which buffered readings are swept (seconds).
pub const ROLLING_BUFFER_MAX_AGE_SECS: u64 = 3_600;

/// Interval between expiry sweeps (seconds).
pub const ROLLING_BUFFER_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Default `limit` for live-buffer queries when the caller gives none.
pub const LIVE_QUERY_DEFAULT_LIMIT: usize = 60;

// ============================================================================
// Trials
// ============================================================================

/// Caller-side timeout applied by the HTTP layer to `end_trial` (seconds).
///
/// A timeout means "recheck status", never "closed".
pub const END_TRIAL_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Ingest
// ============================================================================

/// Largest accepted WebSocket frame (bytes).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Outbound frames queued per connection before the socket reader waits.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

// ============================================================================
// Device Simulator
// ============================================================================

/// Interval between simulated readings (milliseconds).
pub const SIMULATOR_INTERVAL_MS: u64 = 1_000;

/// First reconnect delay after a dropped stream (milliseconds).
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Upper bound for the reconnect delay (milliseconds).
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
