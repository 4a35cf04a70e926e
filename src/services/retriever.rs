use crate::config::RetrievalConfig;
use crate::database::repository::HybridSearchParams;
use crate::database::Repository;
use crate::services::EmbeddingService;
use crate::utils::limiters::Limiters;
use crate::utils::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub boost_tags: Vec<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub decay_days: Option<i32>,
    #[serde(default)]
    pub highlight: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub id: i32,
    pub title: Option<String>,
    pub preview: Option<String>,
    pub ts: DateTime<Utc>,
    pub provider: String,
    pub source_url: Option<String>,
    pub score: f64,
    pub snippet: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
}

/// Clamp shared by every caller that validates `decay_days` — retrieval,
/// the ask engine, and the intent router's normalized params — per the
/// resolved Open Question (c): one policy, not two diverging ranges.
pub fn clamp_decay_days(value: i32) -> i32 {
    value.clamp(1, 30)
}

pub fn resolve_lang_config(language: Option<&str>, query_text: &str) -> &'static str {
    match language {
        Some("tr") => "turkish_unaccent",
        Some("en") => "simple_unaccent",
        _ => {
            if contains_turkish_chars(query_text) {
                "turkish_unaccent"
            } else {
                "simple_unaccent"
            }
        }
    }
}

const TURKISH_CHARS: &[char] = &['ı', 'İ', 'ğ', 'Ğ', 'ş', 'Ş', 'ö', 'Ö', 'ç', 'Ç', 'ü', 'Ü'];

fn contains_turkish_chars(text: &str) -> bool {
    text.chars().any(|c| TURKISH_CHARS.contains(&c))
}

pub struct Retriever {
    repository: Arc<Repository>,
    embedding: Arc<EmbeddingService>,
    config: RetrievalConfig,
    limiters: Arc<Limiters>,
}

impl Retriever {
    pub fn new(
        repository: Arc<Repository>,
        embedding: Arc<EmbeddingService>,
        config: RetrievalConfig,
        limiters: Arc<Limiters>,
    ) -> Self {
        Self {
            repository,
            embedding,
            config,
            limiters,
        }
    }

    /// Hybrid lexical + semantic search (4.H). Query-embedding failure
    /// is non-fatal: retrieval degrades to BM25-only.
    pub async fn search(&self, query: SearchQuery) -> Result<SearchResponse, CoreError> {
        let query_text = effective_query_text(&query);
        if query_text.trim().is_empty() {
            return Err(CoreError::BadRequest("q (or keywords) must not be empty".to_string()));
        }

        let limit = query.limit.unwrap_or(self.config.default_limit).clamp(1, 200);
        let offset = query.offset.unwrap_or(0).max(0);
        let decay_days = clamp_decay_days(query.decay_days.unwrap_or(self.config.default_decay_days));
        let lang_config = resolve_lang_config(query.language.as_deref(), &query_text);

        let query_embedding = self.embedding.embed(&query_text).await.ok();

        let params = HybridSearchParams {
            query_text,
            lang_config,
            query_embedding,
            tags: query.tags,
            boost_tags: query.boost_tags,
            date_from: query.date_from,
            date_to: query.date_to,
            decay_days,
            highlight: query.highlight,
            limit,
            offset,
        };

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.db_search.clone(),
            self.limiters.acquire_timeout,
            "db_search",
        )
        .await
        .map_err(|e| CoreError::UpstreamTransient(e.to_string()))?;
        tracing::debug!(wait_ms = wait.as_millis() as u64, op = "db_search", "wait_queue");

        let (hits, total) = tokio::try_join!(
            self.repository.hybrid_search(&params),
            self.repository.count_hybrid_matches(&params),
        )
        .map_err(CoreError::from)?;

        let out: Vec<SearchHit> = hits
            .into_iter()
            .map(|h| SearchHit {
                id: h.id,
                title: h.title,
                preview: h.preview,
                ts: h.ts,
                provider: h.provider,
                source_url: h.source_url,
                score: coerce_finite(h.final_score),
                snippet: h.snippet,
            })
            .collect();

        let returned = offset + out.len() as i64;
        let has_more = returned < total;
        let next_offset = has_more.then_some(returned);

        Ok(SearchResponse {
            hits: out,
            total,
            has_more,
            next_offset,
        })
    }
}

fn effective_query_text(query: &SearchQuery) -> String {
    if let Some(q) = &query.q {
        if !q.trim().is_empty() {
            return q.clone();
        }
    }
    query.keywords.join(" ")
}

/// Wire contract: `score` must be a finite float; NaN/∞ coerce to 0.
pub fn coerce_finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_days_clamps_to_range() {
        assert_eq!(clamp_decay_days(0), 1);
        assert_eq!(clamp_decay_days(31), 30);
        assert_eq!(clamp_decay_days(15), 15);
    }

    #[test]
    fn lang_config_auto_detects_turkish() {
        assert_eq!(resolve_lang_config(None, "Başlık hakkında"), "turkish_unaccent");
        assert_eq!(resolve_lang_config(None, "plain english query"), "simple_unaccent");
    }

    #[test]
    fn lang_config_respects_explicit_choice() {
        assert_eq!(resolve_lang_config(Some("en"), "Başlık"), "simple_unaccent");
    }

    #[test]
    fn coerce_finite_handles_nan_and_inf() {
        assert_eq!(coerce_finite(f64::NAN), 0.0);
        assert_eq!(coerce_finite(f64::INFINITY), 0.0);
        assert_eq!(coerce_finite(0.5), 0.5);
    }
}
