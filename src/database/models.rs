use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A document as returned to callers that only need the summary fields
/// (search hits, latest-from listings, ask-engine context).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DocumentSummary {
    pub id: i32,
    pub provider: String,
    pub title: Option<String>,
    pub preview: Option<String>,
    pub plain_text: String,
    pub ts: DateTime<Utc>,
    pub source_url: Option<String>,
}

/// A single row produced by the hybrid ranking query of the retriever (4.H).
#[derive(Debug, Clone, FromRow)]
pub struct HybridHit {
    pub id: i32,
    pub title: Option<String>,
    pub preview: Option<String>,
    #[allow(dead_code)]
    pub plain_text: String,
    pub ts: DateTime<Utc>,
    pub provider: String,
    pub source_url: Option<String>,
    pub final_score: f64,
    pub snippet: Option<String>,
}
