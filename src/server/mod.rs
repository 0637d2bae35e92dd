//! Admin HTTP surface.
//!
//! Thin JSON adapters over the registry and the status projection:
//!
//! - `GET  /admin/llm/config`  — effective configs, API keys masked
//! - `PUT  /admin/llm/config`  — validate and persist a full replacement set
//! - `PUT  /admin/llm/pricing` — partial pricing update by id
//! - `POST /admin/llm/reload`  — rebuild endpoint state from the store
//! - `GET  /admin/llm/status`  — per-endpoint operational status
//! - `GET  /healthz`

use crate::dispatch::state::now_nanos;
use crate::dispatch::{status, DispatchError, ProviderManager};
use crate::storage::{ProviderConfig, ProviderPricing, StoreError};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;

pub fn admin_router(manager: Arc<ProviderManager>) -> Router {
    Router::new()
        .route("/admin/llm/config", get(get_config).put(put_config))
        .route("/admin/llm/pricing", put(put_pricing))
        .route("/admin/llm/reload", post(post_reload))
        .route("/admin/llm/status", get(get_status))
        .route("/healthz", get(healthz))
        .with_state(manager)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_config(
    State(manager): State<Arc<ProviderManager>>,
) -> Result<Json<Vec<ProviderConfig>>, AppError> {
    let configs = manager.registry().list_configs().await?;
    Ok(Json(configs))
}

async fn put_config(
    State(manager): State<Arc<ProviderManager>>,
    Json(configs): Json<Vec<ProviderConfig>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = configs.len();
    manager.registry().replace_configs(configs).await?;
    Ok(Json(serde_json::json!({ "replaced": count })))
}

async fn put_pricing(
    State(manager): State<Arc<ProviderManager>>,
    Json(updates): Json<Vec<ProviderPricing>>,
) -> Result<Json<serde_json::Value>, AppError> {
    manager
        .registry()
        .store()
        .update_pricing(&updates)
        .await
        .map_err(DispatchError::Store)?;
    Ok(Json(serde_json::json!({ "updated": updates.len() })))
}

async fn post_reload(
    State(manager): State<Arc<ProviderManager>>,
) -> Result<Json<serde_json::Value>, AppError> {
    manager.registry().reload().await?;
    let count = manager.registry().snapshot().await?.len();
    Ok(Json(serde_json::json!({ "endpoints": count })))
}

async fn get_status(
    State(manager): State<Arc<ProviderManager>>,
) -> Result<Json<Vec<status::EndpointStatus>>, AppError> {
    let snapshot = manager.registry().snapshot().await?;
    Ok(Json(status::collect_status(&snapshot, now_nanos())))
}

/// Admin-surface error envelope.
#[derive(Debug)]
pub struct AppError(DispatchError);

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            DispatchError::Validation(_) | DispatchError::InvalidInput(_) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            DispatchError::Store(StoreError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            DispatchError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
        };
        let body = Json(serde_json::json!({
            "error": {
                "type": error_type,
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
