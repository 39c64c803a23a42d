//! Telemetry service
//!
//! Owns every component and wires them together. Construction runs the
//! startup recovery pass, so a `TelemetryService` is ready for traffic as
//! soon as it exists.

use serde::Serialize;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::gateway::IngestionGateway;
use crate::registry::ConnectionRegistry;
use crate::rolling_buffer::{BufferStats, RollingBufferStore};
use crate::storage::{SledTrialStore, StoreError, TrialStore};
use crate::trials::{RecoveryReport, TrialAccumulator, TrialError, TrialStateMachine};

pub struct TelemetryService {
    config: ServiceConfig,
    store: Arc<dyn TrialStore>,
    registry: Arc<ConnectionRegistry>,
    buffer: Arc<RollingBufferStore>,
    accumulator: Arc<TrialAccumulator>,
    trials: Arc<TrialStateMachine>,
    gateway: Arc<IngestionGateway>,
    recovery: RecoveryReport,
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub store_backend: &'static str,
    pub store_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_size_bytes: Option<u64>,
    pub connections: usize,
    pub active_trials: usize,
    pub buffer: BufferStats,
}

impl TelemetryService {
    /// Build the service over an already-open store and recover trial state.
    pub fn new(config: ServiceConfig, store: Arc<dyn TrialStore>) -> Result<Self, TrialError> {
        let accumulator = Arc::new(TrialAccumulator::new(
            Arc::clone(&store),
            config.trials.dedupe_device_timestamps,
        ));
        let trials = Arc::new(TrialStateMachine::new(
            Arc::clone(&store),
            Arc::clone(&accumulator),
        ));
        let buffer = Arc::new(RollingBufferStore::new(config.rolling_buffer.capacity));
        let gateway = Arc::new(IngestionGateway::new(
            Arc::clone(&buffer),
            Arc::clone(&trials),
            Arc::clone(&accumulator),
        ));

        let recovery = trials.recover()?;
        if recovery != RecoveryReport::default() {
            tracing::info!(
                resumed = recovery.resumed,
                completed = recovery.completed,
                backend = store.backend_name(),
                "Trial state recovered from store"
            );
        }

        Ok(Self {
            config,
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            buffer,
            accumulator,
            trials,
            gateway,
            recovery,
        })
    }

    /// Open the sled store named by the config and build the service on it.
    pub fn open(config: ServiceConfig) -> Result<Self, TrialError> {
        let store = SledTrialStore::open(&config.storage.data_dir, config.storage.flush_each_append)?;
        Self::new(config, Arc::new(store))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TrialStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn buffer(&self) -> &Arc<RollingBufferStore> {
        &self.buffer
    }

    pub fn accumulator(&self) -> &Arc<TrialAccumulator> {
        &self.accumulator
    }

    pub fn trials(&self) -> &Arc<TrialStateMachine> {
        &self.trials
    }

    pub fn gateway(&self) -> &Arc<IngestionGateway> {
        &self.gateway
    }

    /// Result of the recovery pass run at construction.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            store_backend: self.store.backend_name(),
            store_ok: self.store.ping().is_ok(),
            store_size_bytes: self.store.size_bytes(),
            connections: self.registry.len().await,
            active_trials: self.trials.active_count(),
            buffer: self.buffer.stats(),
        }
    }

    /// Close every device stream and flush the store.
    ///
    /// Active trials stay `Active` in the store and resume on next start.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let closed = self.registry.close_all("server shutting down").await;
        tracing::info!(connections = closed, "Closed device streams");
        self.store.flush()?;
        tracing::info!(backend = self.store.backend_name(), "Trial store flushed");
        Ok(())
    }
}
