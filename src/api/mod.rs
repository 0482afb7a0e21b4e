//! HTTP API for health checks, group status, and monitoring

use crate::config::ApiConfig;
use crate::coordination::Group;
use crate::error::GroupResult;
use crate::model::{Stream, TransactionState};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub group: Arc<Group>,
}

pub fn router(group: Arc<Group>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { group })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, group: Arc<Group>) -> GroupResult<()> {
    let app = router(group);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store reachable and loops running
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.group.store().health_check().await.is_ok();
    let running = !state.group.is_stopped().await;

    let status = if store && running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: store && running,
            store,
            running,
        }),
    )
}

/// Group identity and draining progress
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let group = &state.group;
    let mut checkpoints = BTreeMap::new();
    for stream in [Stream::Multisig, Stream::Collectible] {
        match group.checkpoint(stream).await {
            Ok(ckpt) => {
                checkpoints.insert(stream.label(), ckpt);
            }
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
            }
        }
    }

    let status = StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        group_id: group.genesis_id().to_string(),
        members: group.members().to_vec(),
        threshold: group.threshold(),
        epoch: group.epoch(),
        checkpoints,
    };
    (StatusCode::OK, Json(serde_json::json!(status)))
}

/// Transaction counts per lifecycle state and stream
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.group.store();
    let counts = try_join_all(
        [Stream::Multisig, Stream::Collectible]
            .into_iter()
            .flat_map(|stream| TransactionState::all().map(|s| (stream, s)))
            .map(|(stream, s)| {
                let store = store.clone();
                async move {
                    let n = store.count_transactions(stream, s).await?;
                    GroupResult::Ok((stream, s, n))
                }
            }),
    )
    .await;

    match counts {
        Ok(counts) => {
            let mut stats = StatsResponse::default();
            for (stream, s, n) in counts {
                let bucket = match stream {
                    Stream::Multisig => &mut stats.multisig,
                    Stream::Collectible => &mut stats.collectible,
                };
                bucket.insert(s.name(), n);
            }
            (StatusCode::OK, Json(stats))
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(StatsResponse::default())),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    running: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    group_id: String,
    members: Vec<String>,
    threshold: u8,
    epoch: DateTime<Utc>,
    checkpoints: BTreeMap<&'static str, DateTime<Utc>>,
}

#[derive(Serialize, Default)]
struct StatsResponse {
    multisig: BTreeMap<&'static str, u64>,
    collectible: BTreeMap<&'static str, u64>,
}
