// TillPulse HTTP gateway
//
// Exposes the engine over REST endpoints and SSE streaming for the
// dashboard UI, plus an ingest endpoint that feeds record changes into the
// change stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use tillpulse_core::listener::{ChangeEvent, ChangeKind, ChannelFeed};
use tillpulse_core::model::SystemStatus;
use tillpulse_core::{
    aggregate, period, BroadcastHub, HealthMonitor, MetricsStore, PulseError,
};

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 500;

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Room that SSE sessions join.
    pub room: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4040,
            room: "admin-dashboard".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("TILLPULSE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("TILLPULSE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4040),
            room: std::env::var("TILLPULSE_ROOM")
                .unwrap_or_else(|_| "admin-dashboard".to_string()),
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct GatewayState {
    pub hub: Arc<BroadcastHub>,
    pub health: Arc<HealthMonitor>,
    pub store: Arc<dyn MetricsStore>,
    pub feed: Arc<ChannelFeed>,
    pub room: String,
}

/// Builds the API router over the given state.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/stream", get(stream_handler))
        .route("/api/kpis", get(kpis_handler))
        .route("/api/transactions/recent", get(recent_transactions_handler))
        .route("/api/alerts/active", get(active_alerts_handler))
        .route("/api/health", get(health_handler))
        .route("/api/changes/:dataset", post(ingest_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Binds and serves the gateway until the process exits.
pub async fn serve(config: GatewayConfig, state: GatewayState) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        target: "gateway",
        url = %format!("http://{}", addr),
        room = %config.room,
        "gateway ready"
    );
    axum::serve(listener, router(state)).await
}

fn next_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("sess_{:x}", nanos)
}

/// Removes the session from the hub when the SSE stream is dropped.
struct SessionGuard {
    hub: Arc<BroadcastHub>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.leave(&self.session_id);
    }
}

#[derive(Deserialize)]
struct StreamQuery {
    room: Option<String>,
}

/// SSE endpoint for live dashboard events. The first frame is always the
/// room's sync event; live events follow in publish order.
async fn stream_handler(
    State(state): State<GatewayState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)>
{
    let room = query.room.unwrap_or_else(|| state.room.clone());
    // Only the configured room is joinable; arbitrary client-supplied
    // names would mint registry entries that live for the whole process.
    if room != state.room {
        return Err((StatusCode::NOT_FOUND, format!("unknown room: {}", room)));
    }
    let session_id = next_session_id();
    info!(target: "gateway", session = %session_id, room = %room, "SSE client connected");

    let rx = state.hub.join(&room, &session_id);
    let guard = SessionGuard {
        hub: state.hub.clone(),
        session_id,
    };

    let stream = ReceiverStream::new(rx).filter_map(move |event| {
        // Holding the guard ties the hub registration to the stream's life.
        let _ = &guard;
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(e) => {
                warn!(target: "gateway", error = %e, "failed to serialize event");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct KpiQuery {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// On-demand KPI snapshot for an arbitrary window.
async fn kpis_handler(
    State(state): State<GatewayState>,
    Query(query): Query<KpiQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let periods = period::compute_range(query.start, query.end).map_err(bad_request)?;
    let fetch_range = tillpulse_core::DateRange {
        start: periods.previous.start,
        end: periods.current.end,
    };
    let transactions = state
        .store
        .fetch_transactions(&fetch_range, None)
        .await
        .map_err(internal_error)?;
    let snapshot =
        aggregate::aggregate(&transactions, &periods.current).map_err(internal_error)?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    DEFAULT_RECENT_LIMIT
}

async fn recent_transactions_handler(
    State(state): State<GatewayState>,
    Query(query): Query<RecentQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = query.limit.min(MAX_RECENT_LIMIT);
    let transactions = state
        .store
        .recent_transactions(limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(transactions))
}

async fn active_alerts_handler(
    State(state): State<GatewayState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let alerts = state.store.active_alerts().await.map_err(internal_error)?;
    Ok(Json(alerts))
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: SystemStatus,
    pub active_sessions: usize,
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: state.health.snapshot(),
        active_sessions: state.hub.session_count(),
    })
}

#[derive(Deserialize)]
struct IngestBody {
    event: ChangeKind,
    record: serde_json::Value,
}

/// Ingest endpoint: applies the change to the store and forwards it onto
/// the change feed. Accepted even when no listener is subscribed yet; the
/// store write alone makes the record visible to polls and recomputes.
async fn ingest_handler(
    State(state): State<GatewayState>,
    Path(dataset): Path<String>,
    Json(body): Json<IngestBody>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let change = ChangeEvent {
        dataset,
        kind: body.event,
        record: body.record,
    };
    state
        .store
        .record_change(&change)
        .await
        .map_err(bad_request)?;
    if let Err(e) = state.feed.push(change).await {
        warn!(target: "gateway", error = %e, "change not forwarded to feed");
    }
    Ok(StatusCode::ACCEPTED)
}

fn bad_request(e: PulseError) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn internal_error(e: PulseError) -> (StatusCode, String) {
    warn!(target: "gateway", error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
