//! Device stream WebSocket
//!
//! `GET /ws/stream/:patient_id?device_id=...`
//!
//! One task per connection reads frames and hands them to the ingestion
//! gateway; a writer task drains the connection's outbound queue so acks,
//! and close frames sent by the registry, go out in order.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::envelope::ApiErrorResponse;
use super::handlers::ApiState;
use crate::config::defaults;
use crate::gateway::IngestionGateway;
use crate::registry::Outbound;
use crate::types::{PatientId, ReadingAck};

/// How long a closing stream waits for queued acks to go out.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub device_id: Option<String>,
}

/// Upgrade handler for device streams.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(patient_id): Path<PatientId>,
    Query(q): Query<StreamQuery>,
) -> Response {
    if patient_id <= 0 {
        return ApiErrorResponse::bad_request(format!("Invalid patient id {patient_id}"));
    }
    let device_id = q
        .device_id
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| format!("device-{patient_id}"));
    let max_bytes = state.service.config().ingest.max_message_bytes;

    ws.max_message_size(max_bytes)
        .on_upgrade(move |socket| handle_stream(socket, state, patient_id, device_id))
        .into_response()
}

async fn handle_stream(socket: WebSocket, state: ApiState, patient_id: PatientId, device_id: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(defaults::OUTBOUND_QUEUE_DEPTH);
    let mut writer = tokio::spawn(write_outbound(sink, rx));

    let registry = Arc::clone(state.service.registry());
    let gateway = Arc::clone(state.service.gateway());
    let handle = registry.register(patient_id, device_id.clone(), tx).await;

    let connected = serde_json::json!({
        "status": "connected",
        "message": format!("Connected to stream for patient {patient_id}"),
        "patient_id": patient_id,
        "device_id": device_id,
    });
    handle.send_text(connected.to_string()).await;

    let mut received: u64 = 0;
    let mut writer_done = false;
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            // Writer exits after sending a close frame (replaced / shutdown).
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let ack = ReadingAck::error("binary frames must be UTF-8 JSON");
                    if !send_ack(&handle, &ack).await {
                        break;
                    }
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(patient_id, conn_id = handle.conn_id, error = %e, "Stream read error");
                break;
            }
        };

        received += 1;
        let ack = ingest_blocking(&gateway, patient_id, &device_id, text).await;
        if !send_ack(&handle, &ack).await {
            break;
        }
    }

    registry.unregister_connection(patient_id, handle.conn_id).await;
    // Last sender gone: the writer flushes what is queued, then closes.
    drop(handle);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        tracing::debug!(patient_id, "Outbound queue did not drain, dropping");
        writer.abort();
    }
    tracing::info!(patient_id, device_id = %device_id, received, "Stream closed");
}

/// Run the gateway off the async workers; trial log appends hit disk.
async fn ingest_blocking(
    gateway: &Arc<IngestionGateway>,
    patient_id: PatientId,
    device_id: &str,
    text: String,
) -> ReadingAck {
    let gateway = Arc::clone(gateway);
    let device = device_id.to_string();
    let result =
        tokio::task::spawn_blocking(move || gateway.on_reading(patient_id, &device, &text)).await;

    match result {
        Ok(Ok(ack)) => ack,
        Ok(Err(e)) => {
            tracing::warn!(patient_id, device_id, code = e.code(), error = %e, "Reading rejected");
            ReadingAck::error(e.to_string())
        }
        Err(e) => {
            tracing::error!(patient_id, error = %e, "Ingestion task failed");
            ReadingAck::error("internal error")
        }
    }
}

async fn send_ack(handle: &crate::registry::ConnectionHandle, ack: &ReadingAck) -> bool {
    match serde_json::to_string(ack) {
        Ok(text) => handle.send_text(text).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize ack");
            true
        }
    }
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Owned(reason),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
