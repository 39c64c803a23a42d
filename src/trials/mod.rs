//! Trial recording
//!
//! - `state_machine`: per-patient start/end lifecycle and startup recovery
//! - `accumulator`: durable per-trial append log
//! - `finalizer`: log -> columnar record conversion and commit
//! - `error`: errors shared by the three

mod accumulator;
mod error;
mod finalizer;
mod state_machine;

pub use accumulator::{AppendOutcome, TrialAccumulator};
pub use error::TrialError;
pub use finalizer::{build_record, column_stats, render_metadata, FinalizeOutcome, TrialFinalizer};
pub use state_machine::{EndOutcome, RecoveryReport, StartOutcome, TrialState, TrialStateMachine};
