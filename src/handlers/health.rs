use axum::{extract::Extension, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::AppState;

/// `GET /health` (6. External Interfaces). The HTTP transport, auth, and
/// ops endpoints are external collaborators; this handler only reports
/// the shape the core promises them: `{ok, env: {...}}`.
pub async fn health_check(Extension(state): Extension<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let body = json!({
        "ok": true,
        "env": {
            "embed_model": state.settings.embedding.model,
            "embed_dim": state.settings.embedding.dimension,
            "local_embed": state.settings.embedding.local_embed,
        },
    });
    (StatusCode::OK, Json(body))
}

pub async fn readiness_check(Extension(state): Extension<Arc<AppState>>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.db_pool.get_pool()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
