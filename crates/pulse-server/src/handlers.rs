//! HTTP handlers for subscribe, broadcast and targeted send, plus health and
//! metrics.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use pulse_core::{ChannelKey, ConnectionId, HubError};
use serde::{Deserialize, Serialize};

use crate::error::HttpError;
use crate::server::AppState;

pub const X_CONNECTION_ID: HeaderName = HeaderName::from_static("x-connection-id");

/// The `message` query parameter of broadcast and send.
///
/// The first `message` wins when the parameter repeats. A query string that
/// cannot be decoded counts as carrying no message.
#[derive(Debug, Default, PartialEq)]
pub struct MessageParams {
    pub message: Option<String>,
}

impl MessageParams {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let message = pairs
            .into_iter()
            .find(|(key, _)| key == "message")
            .map(|(_, value)| value);
        Self { message }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for MessageParams {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<Vec<(String, String)>>::from_request_parts(parts, state).await {
            Ok(Query(pairs)) => Ok(Self::from_pairs(pairs)),
            Err(rejection) => {
                tracing::debug!(error = %rejection, "Undecodable query string");
                Ok(Self::default())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct BroadcastResponse {
    pub status: String,
    pub clients: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SendResponse {
    pub status: String,
    pub client: String,
    pub delivered: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connected_clients: usize,
    pub channels: usize,
    pub started_at: String,
}

// ── Subscribe ───────────────────────────────────────────────────────────────

pub async fn subscribe_default(State(state): State<AppState>) -> Result<Response, HttpError> {
    subscribe(&state, &ChannelKey::default())
}

pub async fn subscribe_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Response, HttpError> {
    let key = ChannelKey::parse(&channel)?;
    subscribe(&state, &key)
}

/// Open an event stream on `key`. The body stays open until the client goes
/// away or the channel is closed.
fn subscribe(state: &AppState, key: &ChannelKey) -> Result<Response, HttpError> {
    let subscription = state.store.subscribe(key)?;
    let id = HeaderValue::from_str(subscription.id.as_str())
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    let mut response = Response::new(Body::from_stream(subscription.stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(X_CONNECTION_ID, id);
    Ok(response)
}

// ── Broadcast ───────────────────────────────────────────────────────────────

pub async fn broadcast_default(
    State(state): State<AppState>,
    params: MessageParams,
) -> Result<Json<BroadcastResponse>, HttpError> {
    broadcast(&state, &ChannelKey::default(), params).await
}

pub async fn broadcast_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    params: MessageParams,
) -> Result<Json<BroadcastResponse>, HttpError> {
    let key = ChannelKey::parse(&channel)?;
    broadcast(&state, &key, params).await
}

async fn broadcast(
    state: &AppState,
    key: &ChannelKey,
    params: MessageParams,
) -> Result<Json<BroadcastResponse>, HttpError> {
    let clients = state
        .store
        .broadcast(key, params.message.as_deref())
        .await?;
    Ok(Json(BroadcastResponse {
        status: "Message broadcast".into(),
        clients,
    }))
}

// ── Targeted send ───────────────────────────────────────────────────────────

pub async fn send_default(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: MessageParams,
) -> Result<Json<SendResponse>, HttpError> {
    send(&state, &ChannelKey::default(), id, params).await
}

pub async fn send_channel(
    State(state): State<AppState>,
    Path((channel, id)): Path<(String, String)>,
    params: MessageParams,
) -> Result<Json<SendResponse>, HttpError> {
    let key = ChannelKey::parse(&channel)?;
    send(&state, &key, id, params).await
}

async fn send(
    state: &AppState,
    key: &ChannelKey,
    id: String,
    params: MessageParams,
) -> Result<Json<SendResponse>, HttpError> {
    let id = ConnectionId::from_raw(id);
    let delivered = state
        .store
        .send_to(key, &id, params.message.as_deref())
        .await?;
    Ok(Json(SendResponse {
        status: "Message sent".into(),
        client: id.to_string(),
        delivered,
    }))
}

// ── Introspection ───────────────────────────────────────────────────────────

pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        message: "Pulse server is running".into(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        connected_clients: state.store.connection_count(),
        channels: state.store.channel_count(),
        started_at: state.started_at.to_rfc3339(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.metrics.snapshot()))
}

pub async fn not_found(uri: Uri) -> HttpError {
    HubError::UnknownRoute(uri.path().to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn first_message_wins() {
        let params = MessageParams::from_pairs(pairs(&[("message", "a"), ("message", "b")]));
        assert_eq!(params.message.as_deref(), Some("a"));
    }

    #[test]
    fn other_keys_are_ignored() {
        let params = MessageParams::from_pairs(pairs(&[("other", "1"), ("message", "x")]));
        assert_eq!(params.message.as_deref(), Some("x"));
        assert_eq!(MessageParams::from_pairs(pairs(&[("other", "1")])), MessageParams::default());
    }

    #[tokio::test]
    async fn extractor_reads_query() {
        let request = axum::http::Request::builder()
            .uri("/broadcast?message=a%20b&message=c")
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();
        let params = MessageParams::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(params.message.as_deref(), Some("a b"));
    }
}
