use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Spans the whole crate (7. Error Handling Design). Soft-failure paths
/// (tag extraction, agent dispatch, summarization without an LLM) catch
/// these internally and degrade rather than letting them reach the HTTP
/// layer; only genuine boundary failures are turned into a response here.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream provider rejected credentials: {0}")]
    UpstreamAuth(String),

    #[error("upstream provider transient failure: {0}")]
    UpstreamTransient(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Store(err.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            CoreError::BadRequest(msg) => {
                tracing::warn!("bad_request: {}", msg);
                (StatusCode::BAD_REQUEST, "bad_request", msg)
            }
            CoreError::UpstreamAuth(msg) => {
                tracing::error!("embedding_provider_auth_error: {}", msg);
                (StatusCode::BAD_GATEWAY, "embedding_provider_auth_error", msg)
            }
            CoreError::UpstreamTransient(msg) => {
                tracing::error!("upstream_transient: {}", msg);
                (StatusCode::BAD_GATEWAY, "upstream_transient", msg)
            }
            CoreError::Store(msg) => {
                tracing::error!("db_error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "db_error", msg)
            }
            CoreError::Internal(msg) => {
                tracing::error!("internal_error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };

        let body = Json(ErrorBody {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
