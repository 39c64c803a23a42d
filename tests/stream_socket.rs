//! Device Stream Tests
//!
//! Serve the app on an ephemeral port and drive `/ws/stream/:patient_id`
//! with a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use vitalstream::api::{create_app, ApiState};
use vitalstream::storage::InMemoryTrialStore;
use vitalstream::types::{AckStatus, ReadingAck};
use vitalstream::{ServiceConfig, TelemetryService};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve() -> (Arc<TelemetryService>, std::net::SocketAddr) {
    let service = Arc::new(
        TelemetryService::new(ServiceConfig::default(), Arc::new(InMemoryTrialStore::new()))
            .unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(ApiState::new(Arc::clone(&service)));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (service, addr)
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn ack_for_last_reading_arrives_before_close() {
    let (service, addr) = serve().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/stream/31?device_id=bed-31"))
        .await
        .unwrap();

    let greeting: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(greeting["status"], "connected");
    assert_eq!(greeting["device_id"], "bed-31");

    // Close straight after the reading; its ack is still queued server-side.
    ws.send(Message::Text(r#"{"sensor_data":{"heart_rate":70}}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Close(None)).await.unwrap();

    let ack: ReadingAck = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.trial_id, None);
    assert_eq!(service.buffer().query(31, 10).len(), 1);
}

#[tokio::test]
async fn invalid_frame_gets_error_ack_and_stream_stays_open() {
    let (service, addr) = serve().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/stream/32")).await.unwrap();
    next_text(&mut ws).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let ack: ReadingAck = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(ack.status, AckStatus::Error);

    ws.send(Message::Text(r#"{"sensor_data":{"spo2":97}}"#.to_string()))
        .await
        .unwrap();
    let ack: ReadingAck = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(service.buffer().query(32, 10).len(), 1);
}
