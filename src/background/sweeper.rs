//! Rolling buffer expiry sweeper
//!
//! Removes live-display readings older than the configured maximum age.
//! Runs independently of capacity eviction and never touches trial logs.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rolling_buffer::RollingBufferStore;

pub struct BufferSweeper {
    buffer: Arc<RollingBufferStore>,
    max_age: Duration,
    interval: Duration,
}

impl BufferSweeper {
    pub fn new(buffer: Arc<RollingBufferStore>, max_age: Duration, interval: Duration) -> Self {
        Self {
            buffer,
            max_age,
            interval,
        }
    }

    /// Run one sweep. Returns the number of readings removed.
    pub fn sweep_once(&self) -> usize {
        let removed = self.buffer.sweep_expired(self.max_age);
        if removed > 0 {
            info!(removed, max_age_secs = self.max_age.as_secs(), "Expired live readings swept");
        } else {
            debug!("Sweep found nothing to expire");
        }
        removed
    }

    /// Sweep every `interval` until cancelled. Returns total readings removed.
    pub async fn run(self, cancel_token: CancellationToken) -> usize {
        info!(
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "[BufferSweeper] Task starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first tick fires immediately; nothing can be expired yet.
        interval.tick().await;

        let mut total = 0;
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!(total_removed = total, "[BufferSweeper] Received shutdown signal");
                    return total;
                }
                _ = interval.tick() => {
                    total += self.sweep_once();
                }
            }
        }
    }
}
