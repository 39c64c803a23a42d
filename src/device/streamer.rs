//! Device stream client
//!
//! Connects to `/ws/stream/:patient_id`, sends one reading per interval and
//! tallies the acks. A dropped or refused connection is retried with
//! exponential backoff until cancelled.

use chrono::{SecondsFormat, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ReconnectPolicy, VitalsGenerator};
use crate::types::{AckStatus, PatientId, ReadingAck};

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:8080`.
    pub server_url: String,
    pub patient_id: PatientId,
    pub device_id: String,
    pub interval: Duration,
    /// Stop after this many readings have been sent.
    pub max_readings: Option<u64>,
    /// Send device timestamps with each reading.
    pub device_timestamps: bool,
}

impl StreamerConfig {
    pub fn stream_url(&self) -> String {
        format!(
            "{}/ws/stream/{}?device_id={}",
            self.server_url.trim_end_matches('/'),
            self.patient_id,
            self.device_id
        )
    }
}

/// Counters for one simulator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub sent: u64,
    pub acked: u64,
    pub rejected: u64,
    pub in_trial: u64,
    pub connections: u64,
}

pub struct DeviceStreamer {
    config: StreamerConfig,
    generator: VitalsGenerator,
    policy: ReconnectPolicy,
    stats: StreamStats,
}

#[derive(Serialize)]
struct OutgoingReading<'a> {
    patient_id: PatientId,
    device_id: &'a str,
    sensor_data: std::collections::BTreeMap<String, crate::types::SensorValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum SessionEnd {
    Cancelled,
    Finished,
    Disconnected,
}

impl DeviceStreamer {
    pub fn new(config: StreamerConfig, generator: VitalsGenerator, policy: ReconnectPolicy) -> Self {
        Self {
            config,
            generator,
            policy,
            stats: StreamStats::default(),
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    fn finished(&self) -> bool {
        self.config
            .max_readings
            .is_some_and(|max| self.stats.sent >= max)
    }

    /// Stream until cancelled or `max_readings` is reached.
    pub async fn run(mut self, cancel_token: CancellationToken) -> StreamStats {
        let url = self.config.stream_url();
        info!(url = %url, device_id = %self.config.device_id, "Device simulator starting");

        loop {
            if cancel_token.is_cancelled() || self.finished() {
                break;
            }

            let connect = tokio::select! {
                _ = cancel_token.cancelled() => break,
                c = connect_async(url.as_str()) => c,
            };

            let ws = match connect {
                Ok((ws, _)) => ws,
                Err(e) => {
                    let delay = self.policy.next_delay();
                    warn!(
                        attempt = self.policy.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Connection failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            self.policy.reset();
            self.stats.connections += 1;
            info!(connections = self.stats.connections, "Connected to server");

            match self.session(ws, &cancel_token).await {
                SessionEnd::Cancelled | SessionEnd::Finished => break,
                SessionEnd::Disconnected => {
                    let delay = self.policy.next_delay();
                    warn!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Stream dropped, reconnecting");
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(
            sent = self.stats.sent,
            acked = self.stats.acked,
            rejected = self.stats.rejected,
            in_trial = self.stats.in_trial,
            "Device simulator stopped"
        );
        self.stats
    }

    async fn session(&mut self, ws: WsStream, cancel_token: &CancellationToken) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = ticker.tick() => {
                    if self.finished() {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Finished;
                    }
                    let Some(frame) = self.next_frame() else {
                        continue;
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                    self.stats.sent += 1;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.record_ack(&text),
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Server closed the stream");
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Stream error");
                        return SessionEnd::Disconnected;
                    }
                    None => return SessionEnd::Disconnected,
                },
            }
        }
    }

    fn next_frame(&mut self) -> Option<String> {
        let reading = OutgoingReading {
            patient_id: self.config.patient_id,
            device_id: &self.config.device_id,
            sensor_data: self.generator.next_values(),
            timestamp: self
                .config
                .device_timestamps
                .then(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        };
        match serde_json::to_string(&reading) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "Failed to encode reading");
                None
            }
        }
    }

    fn record_ack(&mut self, text: &str) {
        let Ok(ack) = serde_json::from_str::<ReadingAck>(text) else {
            // The greeting frame and anything else that is not an ack.
            debug!(frame = %text, "Server message");
            return;
        };
        match ack.status {
            AckStatus::Ok => {
                self.stats.acked += 1;
                if ack.trial_id.is_some() {
                    self.stats.in_trial += 1;
                }
            }
            AckStatus::Error => {
                self.stats.rejected += 1;
                warn!(message = ack.message.as_deref().unwrap_or(""), "Reading rejected");
            }
        }
    }
}
