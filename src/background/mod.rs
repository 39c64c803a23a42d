//! Background services
//!
//! Long-running maintenance tasks supervised alongside the HTTP server.
//! Each runs until its `CancellationToken` fires.

pub mod sweeper;

pub use sweeper::BufferSweeper;
