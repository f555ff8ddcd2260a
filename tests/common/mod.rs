//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use courier_relay::http::{create_router, AppState};
use courier_relay::mailbox::Mailbox;
use courier_relay::metrics::RelayMetrics;
use courier_relay::prekeys::PrekeyStore;
use courier_relay::registry::{dispatcher, SubscriberRegistry};
use courier_relay::store::{MemoryStore, OrderedStore};

/// A relay listening on an ephemeral local port.
pub struct TestRelay {
    pub base: String,
}

/// Spawns a relay over a fresh in-memory store.
#[allow(dead_code)]
pub async fn spawn_relay() -> TestRelay {
    spawn_relay_with_store(Arc::new(MemoryStore::new())).await
}

/// Spawns a relay over the given store.
#[allow(dead_code)]
pub async fn spawn_relay_with_store(store: Arc<dyn OrderedStore>) -> TestRelay {
    let mailbox = Arc::new(Mailbox::open(store.clone()).expect("mailbox open"));
    let prekeys = Arc::new(PrekeyStore::new(store));
    let registry = Arc::new(SubscriberRegistry::new());
    let metrics = RelayMetrics::new();

    let (dispatcher, handle) = dispatcher(registry.clone(), prekeys.clone(), metrics.clone());
    tokio::spawn(dispatcher.run());

    let router = create_router(AppState {
        mailbox,
        prekeys,
        registry,
        dispatcher: handle,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestRelay {
        base: format!("http://{addr}"),
    }
}

/// Builds an Authorization header value for a device.
#[allow(dead_code)]
pub fn bearer(device: &str) -> String {
    format!("Bearer {device}")
}

/// Posts a JSON batch and asserts the empty-object success body.
#[allow(dead_code)]
pub async fn post_batch(base: &str, sender: &str, batch: &[(&str, &str)]) {
    let elements: Vec<serde_json::Value> = batch
        .iter()
        .map(|(to, payload)| serde_json::json!({"deviceId": to, "payload": payload}))
        .collect();
    let response = reqwest::Client::new()
        .post(format!("{base}/message"))
        .header("authorization", bearer(sender))
        .body(serde_json::json!({ "batch": elements }).to_string())
        .send()
        .await
        .expect("post batch");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({}));
}

/// Fetches a device's mailbox.
#[allow(dead_code)]
pub async fn get_messages(base: &str, device: &str) -> Vec<serde_json::Value> {
    reqwest::Client::new()
        .get(format!("{base}/self/messages"))
        .header("authorization", bearer(device))
        .send()
        .await
        .expect("get messages")
        .json()
        .await
        .expect("messages body")
}

/// Truncates a device's mailbox up to a seqID inclusive.
#[allow(dead_code)]
pub async fn delete_messages(base: &str, device: &str, seq_id: u64) {
    let response = reqwest::Client::new()
        .delete(format!("{base}/self/messages"))
        .header("authorization", bearer(device))
        .body(format!(r#"{{"seqID":{seq_id}}}"#))
        .send()
        .await
        .expect("delete messages");
    assert_eq!(response.status(), 200);
}

/// One parsed server-sent event.
#[allow(dead_code)]
#[derive(Debug)]
pub struct SseFrame {
    pub event: String,
    pub data: serde_json::Value,
}

/// Incrementally parses an open `/events` response into frames, skipping
/// keep-alive comments.
#[allow(dead_code)]
pub struct SseReader {
    response: reqwest::Response,
    buf: String,
}

#[allow(dead_code)]
impl SseReader {
    /// Opens a device's event stream. The subscription is registered by the
    /// time the response headers are back.
    pub async fn open(base: &str, device: &str) -> Self {
        let response = reqwest::Client::new()
            .get(format!("{base}/events"))
            .header("authorization", bearer(device))
            .send()
            .await
            .expect("open event stream");
        assert_eq!(response.status(), 200);
        SseReader {
            response,
            buf: String::new(),
        }
    }

    pub async fn next_frame(&mut self) -> SseFrame {
        loop {
            if let Some(frame) = self.pop_frame() {
                return frame;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.response.chunk())
                .await
                .expect("timed out waiting for an SSE frame")
                .expect("stream error")
                .expect("stream closed");
            self.buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    fn pop_frame(&mut self) -> Option<SseFrame> {
        while let Some(pos) = self.buf.find("\n\n") {
            let raw: String = self.buf.drain(..pos + 2).collect();
            let mut event = None;
            let mut data = None;
            for line in raw.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = Some(rest.to_string());
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = Some(rest.to_string());
                }
            }
            if let (Some(event), Some(data)) = (event, data) {
                return Some(SseFrame {
                    event,
                    data: serde_json::from_str(&data).expect("frame data is JSON"),
                });
            }
            // Comment-only keep-alive frame; keep scanning.
        }
        None
    }
}
