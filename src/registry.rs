//! Connection Registry
//!
//! Tracks one live stream channel per patient. Process-local and not a
//! source of truth for any data; it only routes and supervises sockets.
//! Registering a second connection for a patient displaces the first
//! (last writer wins) and sends the displaced socket a close frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::types::PatientId;

/// Close code sent to a displaced connection (RFC 6455 policy violation).
pub const CLOSE_CODE_REPLACED: u16 = 1008;
/// Close code sent during server shutdown (going away).
pub const CLOSE_CODE_SHUTDOWN: u16 = 1001;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle to a registered device stream.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub patient_id: PatientId,
    pub device_id: String,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Queue a text frame. Returns false once the writer has gone away.
    pub async fn send_text(&self, text: String) -> bool {
        self.sender.send(Outbound::Text(text)).await.is_ok()
    }

    /// Ask the writer to close the socket.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .sender
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Patient -> live connection map.
#[derive(Default)]
pub struct ConnectionRegistry {
    conn_counter: AtomicU64,
    connections: RwLock<HashMap<PatientId, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for `patient_id`, closing any connection it replaces.
    pub async fn register(
        &self,
        patient_id: PatientId,
        device_id: impl Into<String>,
        sender: mpsc::Sender<Outbound>,
    ) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle {
            conn_id: self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1,
            patient_id,
            device_id: device_id.into(),
            sender,
        });

        let displaced = {
            let mut connections = self.connections.write().await;
            connections.insert(patient_id, Arc::clone(&handle))
        };

        if let Some(old) = displaced {
            tracing::warn!(
                patient_id,
                old_conn = old.conn_id,
                new_conn = handle.conn_id,
                old_device = %old.device_id,
                "Replacing existing stream for patient"
            );
            old.close(CLOSE_CODE_REPLACED, "replaced by a newer connection").await;
        } else {
            tracing::info!(patient_id, conn_id = handle.conn_id, device_id = %handle.device_id, "Stream registered");
        }

        handle
    }

    /// Remove the registration for a patient unconditionally.
    pub async fn unregister(&self, patient_id: PatientId) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().await.remove(&patient_id)
    }

    /// Remove the registration only if it is still `conn_id`.
    ///
    /// A displaced connection calls this on exit and must not evict its
    /// replacement.
    pub async fn unregister_connection(&self, patient_id: PatientId, conn_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&patient_id) {
            Some(current) if current.conn_id == conn_id => {
                connections.remove(&patient_id);
                tracing::info!(patient_id, conn_id, "Stream unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, patient_id: PatientId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&patient_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and forget every connection (shutdown).
    pub async fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.close(CLOSE_CODE_SHUTDOWN, reason).await;
        }
        drained.len()
    }
}
