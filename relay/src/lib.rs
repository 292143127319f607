use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use howlmesh_p2p::http_relay::{PollResponse, PublishRequest, PublishResponse};
use howlmesh_p2p::MemoryBroker;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};

pub const SERVICE_NAME: &str = "howlmesh-relay";
const PROTOCOL_VERSION: &str = "0.1";
/// Longest a single poll may hang, whatever the client asks for.
const MAX_WAIT_MS: u64 = 30_000;
/// Largest payload accepted on a topic.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    broker: MemoryBroker,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    protocol_version: &'static str,
    topics: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    detail: String,
}

#[derive(Debug, Default, Deserialize)]
struct PollQuery {
    after: Option<u64>,
    wait_ms: Option<u64>,
}

/// The relay's HTTP surface over `broker`.
pub fn app(broker: MemoryBroker) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v0/status", get(status))
        .route("/v0/topics/{topic}", get(poll_topic).post(publish))
        .with_state(AppState { broker })
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        protocol_version: PROTOCOL_VERSION,
        topics: state.broker.topic_count().await,
    })
}

#[instrument(skip(state, request))]
async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.payload.len() > MAX_PAYLOAD_BYTES {
        warn!(len = request.payload.len(), "payload rejected");
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ErrorResponse {
                error: "payload_too_large",
                detail: format!(
                    "payload is {} bytes, the limit is {MAX_PAYLOAD_BYTES}",
                    request.payload.len()
                ),
            }),
        ));
    }

    let seq = state.broker.publish(&topic, &request.payload).await;
    debug!(seq, "published");
    Ok(Json(PublishResponse { seq }))
}

/// Long poll. Without `after` the current cursor is returned at once so the
/// caller starts from now.
#[instrument(skip(state, query))]
async fn poll_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<PollQuery>,
) -> Json<PollResponse> {
    let cursor = state.broker.cursor(&topic).await;
    let Some(after) = query.after else {
        return Json(PollResponse {
            messages: Vec::new(),
            cursor,
        });
    };

    let after = if after > cursor {
        debug!(after, cursor, "cursor ahead of relay, rewinding");
        cursor
    } else {
        after
    };
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0).min(MAX_WAIT_MS));
    let messages = state.broker.poll(&topic, after, wait).await;
    let cursor = messages.last().map_or(after, |m| m.seq);
    Json(PollResponse { messages, cursor })
}
