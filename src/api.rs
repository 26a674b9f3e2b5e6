// src/api.rs
//! Thin operator surface over the push service: trigger a cycle, inspect the
//! last outcome, force a fingerprint back into circulation.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::coordinator::PushService;
use crate::dedup::DedupStats;
use crate::outcome::DeliveryResult;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PushService>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/admin/push-cycle", post(push_cycle))
        .route("/admin/last-result", get(last_result))
        .route("/admin/reconcile", post(reconcile))
        .route("/admin/dedup-stats", get(dedup_stats))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn push_cycle(State(state): State<AppState>) -> Json<DeliveryResult> {
    Json(state.service.trigger_cycle().await)
}

async fn last_result(
    State(state): State<AppState>,
) -> Result<Json<Option<DeliveryResult>>, StatusCode> {
    match state.service.last_result().await {
        Ok(last) => Ok(Json(last)),
        Err(e) => {
            tracing::warn!("last-result read failed: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(serde::Deserialize)]
struct ReconcileReq {
    fingerprint: String,
}

#[derive(serde::Serialize)]
struct ReconcileResp {
    fingerprint: String,
    cleared: bool,
}

async fn reconcile(
    State(state): State<AppState>,
    Json(body): Json<ReconcileReq>,
) -> Json<ReconcileResp> {
    let cleared = state.service.reconcile(&body.fingerprint).await;
    Json(ReconcileResp {
        fingerprint: body.fingerprint,
        cleared,
    })
}

async fn dedup_stats(State(state): State<AppState>) -> Json<DedupStats> {
    Json(state.service.dedup_stats())
}
