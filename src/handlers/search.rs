use axum::{extract::Extension, Json};
use std::sync::Arc;

use crate::services::retriever::{SearchQuery, SearchResponse};
use crate::state::AppState;
use crate::utils::CoreError;

/// `POST /search` (6. External Interfaces; 4.H Retriever).
pub async fn search_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<SearchResponse>, CoreError> {
    let response = state.retriever.search(query).await?;
    Ok(Json(response))
}
