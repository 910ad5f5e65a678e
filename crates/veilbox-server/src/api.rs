use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use veilbox_store::StoreStats;

use crate::config::ServerConfig;
use crate::dispatch::{Action, Dispatcher, OutboxTransport, Update};
use crate::error::ServerError;
use crate::flush::Flusher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub flusher: Arc<Flusher>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/updates", post(handle_update))
        .route("/admin/status", get(admin_status))
        .route("/admin/save", post(admin_save))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct UpdateResponse {
    actions: Vec<Action>,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    stats: StoreStats,
    last_saved: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct AdminSaveResponse {
    saved_at: DateTime<Utc>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Apply one update and answer with the transport actions it produced.
async fn handle_update(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(update): Json<Update>,
) -> Result<Json<UpdateResponse>, ServerError> {
    if let Some(expected) = state.config.webhook_secret.as_deref() {
        let presented = headers
            .get("x-webhook-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !secrets_match(presented, expected) {
            warn!(from = %update.sender(), "Update rejected: bad webhook secret");
            return Err(ServerError::Forbidden("Invalid webhook secret".into()));
        }
    }

    let outbox = OutboxTransport::new();
    state.dispatcher.handle(update, &outbox).await?;

    Ok(Json(UpdateResponse {
        actions: outbox.take().await,
    }))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    if !secrets_match(token, expected) {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

/// Constant-time comparison of a presented secret against the configured one.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    presented.len() == expected.len() && presented.ct_eq(expected).unwrap_u8() == 1
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        stats: state.dispatcher.store().stats().await,
        last_saved: state.flusher.last_saved().await,
    }))
}

async fn admin_save(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminSaveResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let saved_at = state.flusher.flush().await?;
    info!(at = %saved_at, "Admin triggered snapshot save");
    Ok(Json(AdminSaveResponse { saved_at }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
