use axum::{extract::Extension, Json};
use std::sync::Arc;

use crate::services::ask_service::{AskRequest, AskResponse};
use crate::state::AppState;
use crate::utils::CoreError;

/// `POST /ask` (6. External Interfaces; 4.I Ask engine).
pub async fn ask_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, CoreError> {
    let response = state.ask_service.ask(request).await?;
    Ok(Json(response))
}
