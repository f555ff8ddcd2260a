//! HTTP Surface
//!
//! Routes: `/events` (SSE stream), `/message` (batch submit),
//! `/self/messages` (mailbox read + truncate), `/devices/otkey` (one-time
//! key lookup), `/self/otkeys` (one-time key publish), plus `/metrics`.
//!
//! Identity is the bearer token taken verbatim as the device id. A missing
//! or short Authorization header yields 401 on `/events` and 404 on the
//! message endpoints, which is what existing clients expect. All responses
//! carry permissive CORS headers; unknown paths and unknown methods for a
//! known path both return 404.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::mailbox::{Delivery, Mailbox};
use crate::metrics::RelayMetrics;
use crate::prekeys::{PrekeyStore, RESTOCK};
use crate::protocol::{parse_batch, NeedsOneTimeKey, OutgoingMessage};
use crate::registry::{
    DispatcherHandle, Notification, SubscriberRegistry, Subscription, CHANNEL_CAPACITY,
};
use crate::sse::EventStream;
use crate::store::StoreError;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub mailbox: Arc<Mailbox>,
    pub prekeys: Arc<PrekeyStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub dispatcher: DispatcherHandle,
    pub metrics: RelayMetrics,
}

/// HTTP-level failure with its response status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        ApiError {
            status,
            detail: detail.into(),
        }
    }

    fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("storage error: {e}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            detail: self.detail.as_str(),
        });
        (self.status, body).into_response()
    }
}

/// Extracts the caller's device id from the bearer token. The token is
/// trusted verbatim; anything shorter than "Bearer x" is rejected.
fn bearer_device(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    if value.len() < 8 {
        return None;
    }
    Some(value[7..].trim().to_string())
}

/// Creates the relay router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(serve_events))
        .route("/message", post(post_message))
        .route("/self/messages", get(get_messages).delete(delete_messages))
        .route("/devices/otkey", get(get_one_time_key))
        .route("/self/otkeys", post(add_one_time_keys))
        .route("/metrics", get(metrics_handler))
        .method_not_allowed_fallback(not_found)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}

/// GET /events: subscribe to the caller's notification stream.
async fn serve_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<axum::response::sse::KeepAliveStream<EventStream>>, ApiError> {
    let device_id =
        bearer_device(&headers).ok_or_else(|| ApiError::unauthorized("not authorized"))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    state
        .dispatcher
        .subscribe(Subscription {
            device_id: device_id.clone(),
            sender: tx,
        })
        .await;

    let stream = EventStream::new(device_id, rx, state.dispatcher.closing_sender());
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

/// POST /message: persist a batch and fan it out to live recipients.
async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sender = bearer_device(&headers).ok_or_else(|| ApiError::not_found("not authorized"))?;

    let batch = parse_batch(&body).map_err(|e| ApiError::bad_request(e.to_string()))?;

    state.metrics.batches_received.inc();
    let deliveries = state.mailbox.post(&sender, &batch).await?;
    state
        .metrics
        .messages_stored
        .inc_by(deliveries.len() as u64);

    // Recipient locks are already released; delivery is non-blocking and a
    // full channel drops (the mailbox is the source of truth).
    for Delivery { to, outgoing } in deliveries {
        if state.registry.try_notify(&to, Notification::Message(outgoing)) {
            state.metrics.fanout_delivered.inc();
        } else {
            state.metrics.fanout_dropped.inc();
        }
    }

    Ok(Json(json!({})))
}

/// GET /self/messages: snapshot of the caller's undelivered messages.
async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<OutgoingMessage>>, ApiError> {
    let device_id =
        bearer_device(&headers).ok_or_else(|| ApiError::not_found("not authorized"))?;

    state.metrics.mailbox_fetches.inc();
    let messages = state.mailbox.fetch(&device_id)?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct TruncateBody {
    #[serde(rename = "seqID")]
    seq_id: u64,
}

/// DELETE /self/messages: drop the caller's messages up to a seqID.
async fn delete_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device_id =
        bearer_device(&headers).ok_or_else(|| ApiError::not_found("not authorized"))?;

    let truncate: TruncateBody =
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?;

    state.mailbox.truncate(&device_id, truncate.seq_id)?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct OtkeyParams {
    device_id: String,
}

/// GET /devices/otkey?device_id=...: pop one of a device's one-time keys.
async fn get_one_time_key(
    State(state): State<AppState>,
    Query(params): Query<OtkeyParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.prekeys.fetch(&params.device_id).await?;

    if outcome.low {
        state
            .dispatcher
            .notify_prekey_low(NeedsOneTimeKey {
                device_id: params.device_id.clone(),
                needs: RESTOCK,
            })
            .await;
    }

    match outcome.otkey {
        Some(otkey) => {
            state.metrics.otkeys_served.inc();
            Ok(Json(json!({ "otkey": otkey })))
        }
        None => {
            state.metrics.otkey_misses.inc();
            Err(ApiError::not_found("no one-time keys"))
        }
    }
}

/// POST /self/otkeys: publish keyId to publicKey pairs; echoes the mapping.
async fn add_one_time_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    let device_id =
        bearer_device(&headers).ok_or_else(|| ApiError::not_found("not authorized"))?;

    let keys: HashMap<String, String> =
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?;

    state.prekeys.add(&device_id, &keys)?;
    state.metrics.otkeys_added.inc_by(keys.len() as u64);
    Ok(Json(keys))
}

/// GET /metrics: Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
