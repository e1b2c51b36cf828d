use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use pve_pool_common::{AllocateRequest, AllocateResponse, HealthResponse, PoolStatus};
use rand::RngCore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use pve_pool_core::PoolManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: PoolManager,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/allocate", post(allocate_handler))
        .route("/release/:vmid", post(release_handler))
        .route("/containers/:vmid", delete(remove_handler))
        .route("/warm/:template", post(warm_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn allocate_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let instance_id = req.instance_id.unwrap_or_else(generate_instance_id);
    let start = params
        .get("start")
        .map(|v| v != "false")
        .unwrap_or(true);

    info!(template_vmid = req.template_vmid, instance_id, "allocate request");

    let response = state
        .manager
        .allocate_and_finalize(req.template_vmid, &instance_id, start)
        .await?;

    Ok(Json(response))
}

async fn release_handler(State(state): State<AppState>, Path(vmid): Path<u32>) -> Json<serde_json::Value> {
    if let Err(e) = state.manager.release(vmid).await {
        // release() only ever returns Err for bugs upstream of the pool
        // lock, never for expected failures (those are already downgraded
        // to a warning inside release()); still never fail the request.
        tracing::error!(vmid, error = %e, "release returned an unexpected error");
    }
    Json(serde_json::json!({ "vmid": vmid, "status": "released" }))
}

async fn remove_handler(State(state): State<AppState>, Path(vmid): Path<u32>) -> Json<serde_json::Value> {
    state.manager.remove(vmid).await;
    Json(serde_json::json!({ "vmid": vmid, "status": "removed" }))
}

async fn warm_handler(
    State(state): State<AppState>,
    Path(template): Path<u32>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    state.manager.ensure_template_entry(template).await;
    let target = params
        .get("count")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(state.manager.config().target_size);
    state.manager.replenish_template_to(template, target).await;
    Json(serde_json::json!({ "template_vmid": template, "target": target }))
}

async fn status_handler(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.manager.get_status().await)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

fn generate_instance_id() -> String {
    let mut bytes = [0u8; 2];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("pvelxc-{hex}")
}
