use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::AppState;
use crate::utils::CoreError;

#[derive(Debug, Deserialize)]
pub struct ExternalIdQuery {
    pub source_type: String,
    pub origin_source: Option<String>,
    pub external_id: String,
}

/// `GET /items/external` (6. External Interfaces). Looks up a document
/// by its provider and external id, scoped to an account when
/// `origin_source` is given. Returns `{external_id, found, item_id?}`
/// with 200 when found, 404 otherwise.
pub async fn find_external_item(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ExternalIdQuery>,
) -> Result<(StatusCode, Json<Value>), CoreError> {
    let found_id = state
        .repository
        .find_existing_external_id(&query.source_type, query.origin_source.as_deref(), &query.external_id)
        .await
        .map_err(CoreError::from)?;

    let status = if found_id.is_some() { StatusCode::OK } else { StatusCode::NOT_FOUND };
    let body = json!({
        "external_id": query.external_id,
        "found": found_id.is_some(),
        "item_id": found_id,
    });

    Ok((status, Json(body)))
}
