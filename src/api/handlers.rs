// src/api/handlers.rs
// Liveness and readiness probes.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /healthz
pub async fn healthz(State(app): State<Arc<AppState>>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "time": Utc::now().timestamp_millis() as f64 / 1000.0,
        "default_collection": app.config.retrieval_collection,
        "env_default": std::env::var("RETRIEVAL_COLLECTION").ok(),
        "embed_model": app.config.embed_model,
        "qdrant_url": app.config.qdrant_url,
    }))
}

/// GET /readyz — ready only when the database answers.
pub async fn readyz(State(app): State<Arc<AppState>>) -> ApiResult<Json<JsonValue>> {
    sqlx::query("SELECT 1")
        .execute(&app.pool)
        .await
        .map_err(|e| ApiError::upstream_unavailable(format!("db not ready: {e}")))?;
    Ok(Json(json!({"status": "ready"})))
}
