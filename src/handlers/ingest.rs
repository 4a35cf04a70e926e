use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::services::ingestor::IngestBoundaryPayload;
use crate::state::AppState;
use crate::utils::CoreError;

/// `POST /ingest/gmail` (6. External Interfaces; 4.G Ingestor). Accepts
/// the three JSON-shaped boundary payloads of 9. Design Notes — a single
/// object, `{items: [...]}`, or a raw (possibly doubly-nested) array —
/// and ingests each collapsed item in turn. A single-item request
/// returns that item's outcome object directly; a multi-item request
/// returns an array of outcomes.
pub async fn ingest_gmail(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<IngestBoundaryPayload>,
) -> Result<(StatusCode, Json<Value>), CoreError> {
    let items = payload.into_items();
    if items.is_empty() {
        return Err(CoreError::BadRequest("no documents in request body".to_string()));
    }

    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let outcome = state.ingestor.ingest(item).await?;
        outcomes.push(serde_json::to_value(outcome).map_err(|e| CoreError::Internal(e.to_string()))?);
    }

    let body = if outcomes.len() == 1 {
        outcomes.into_iter().next().unwrap()
    } else {
        Value::Array(outcomes)
    };

    Ok((StatusCode::OK, Json(body)))
}

#[derive(Debug, Deserialize)]
pub struct ExistsQuery {
    pub account_id: String,
    pub hash: String,
    #[serde(default)]
    pub global_search: bool,
}

/// `HEAD /ingest/gmail/exists` (6. External Interfaces). 200 if a
/// document with this content_hash already exists, scoped to the
/// source (by `account_id`) unless `global_search=true`; 404 otherwise.
/// HEAD responses carry no body.
pub async fn ingest_gmail_exists(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ExistsQuery>,
) -> Result<StatusCode, CoreError> {
    let found = state
        .ingestor
        .exists(&query.account_id, &query.hash, query.global_search)
        .await?;

    match found {
        Some(_) => Ok(StatusCode::OK),
        None => Ok(StatusCode::NOT_FOUND),
    }
}
