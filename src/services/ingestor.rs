use crate::config::{IngestConfig, LlmConfig};
use crate::database::Repository;
use crate::document::{self, ChunkParams, ChunkStrategy};
use crate::services::tag_extractor;
use crate::services::{EmbeddingService, LlmService};
use crate::utils::CoreError;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// One email-shaped document as accepted at the ingest boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailPayload {
    pub account_id: String,
    pub external_id: String,
    #[serde(default)]
    pub subject: String,
    pub plain_text: String,
    pub ts: Option<String>,
    pub from_addr: Option<String>,
    pub from_name: Option<String>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// Collapses the three accepted ingest boundary shapes — a single
/// object, `{"items": [...]}`, or a raw array (including the doubly
/// nested `[{"items": [...]}]` form) — into one list before dispatch
/// (4.G "Boundary payload shapes", 9. Design Notes "JSON-shaped
/// payloads at the boundary").
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestBoundaryPayload {
    Items { items: Vec<EmailPayload> },
    Array(Vec<ItemsOrPayload>),
    Single(Box<EmailPayload>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ItemsOrPayload {
    Items { items: Vec<EmailPayload> },
    Single(Box<EmailPayload>),
}

impl IngestBoundaryPayload {
    pub fn into_items(self) -> Vec<EmailPayload> {
        match self {
            IngestBoundaryPayload::Items { items } => items,
            IngestBoundaryPayload::Single(payload) => vec![*payload],
            IngestBoundaryPayload::Array(entries) => entries
                .into_iter()
                .flat_map(|entry| match entry {
                    ItemsOrPayload::Items { items } => items,
                    ItemsOrPayload::Single(payload) => vec![*payload],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub ok: bool,
    pub document_id: i32,
    pub dedup: bool,
    pub n_chunks: usize,
    pub tags: Vec<String>,
    pub lang: Option<String>,
}

const PROVIDER: &str = "gmail";

pub struct Ingestor {
    repository: Arc<Repository>,
    embedding: Arc<EmbeddingService>,
    llm: Arc<LlmService>,
    ingest_config: IngestConfig,
    llm_config: LlmConfig,
}

impl Ingestor {
    pub fn new(
        repository: Arc<Repository>,
        embedding: Arc<EmbeddingService>,
        llm: Arc<LlmService>,
        ingest_config: IngestConfig,
        llm_config: LlmConfig,
    ) -> Self {
        Self {
            repository,
            embedding,
            llm,
            ingest_config,
            llm_config,
        }
    }

    /// Orchestrates a single document ingest, idempotent on
    /// `content_hash` (4.G). All writes for one document occur across
    /// the steps below; a failure at any step after the early-dedup
    /// check must leave the store observably unchanged from before that
    /// step ran (enforced per-step via upsert/delete-then-insert rather
    /// than a long-lived transaction, since chunk embedding calls
    /// suspend on network I/O and cannot be held inside one sqlx tx).
    pub async fn ingest(&self, payload: EmailPayload) -> Result<IngestOutcome, CoreError> {
        if payload.plain_text.trim().is_empty() {
            return Err(CoreError::BadRequest("plain_text must not be empty".to_string()));
        }

        let normalized = document::normalize_email(
            &payload.subject,
            &payload.plain_text,
            payload.from_addr.as_deref(),
            payload.ts.as_deref(),
            &payload.account_id,
            &payload.external_id,
        );

        let content_hash = payload.content_hash.clone().unwrap_or_else(|| normalized.content_hash.clone());

        let source_id = self
            .repository
            .upsert_source(PROVIDER, &payload.account_id)
            .await
            .map_err(CoreError::from)?;

        if let Some(existing_id) = self
            .repository
            .find_document_by_hash(source_id, &content_hash)
            .await
            .map_err(CoreError::from)?
        {
            return Ok(IngestOutcome {
                ok: true,
                document_id: existing_id,
                dedup: true,
                n_chunks: 0,
                tags: Vec::new(),
                lang: normalized.language,
            });
        }

        let metadata = build_metadata(&payload, &normalized);
        let ts: DateTime<Utc> = normalized.ts;

        let document_id = self
            .repository
            .upsert_document(
                source_id,
                "email",
                &payload.external_id,
                non_empty(&payload.subject),
                non_empty(&preview_of(&normalized.plain_text)),
                &normalized.plain_text,
                ts,
                payload.source_url.as_deref(),
                &metadata,
                &content_hash,
            )
            .await
            .map_err(CoreError::from)?;

        let extracted_tags = tag_extractor::extract_tags(
            &self.llm,
            &self.llm_config.tag_model,
            self.llm_config.enable_oai_tags,
            &payload.subject,
            &normalized.plain_text,
            self.ingest_config.tag_text_budget,
        )
        .await;

        let mut all_tags = payload.tags.clone();
        all_tags.extend(extracted_tags);
        let tags = tag_extractor::normalize_tags(all_tags);

        self.repository
            .upsert_tags_and_attach(document_id, &tags)
            .await
            .map_err(CoreError::from)?;

        let lang_config = if normalized.language.as_deref() == Some("tr") {
            "turkish_unaccent"
        } else {
            "simple_unaccent"
        };

        let chunk_params = ChunkParams {
            target: self.ingest_config.chunk_target_chars,
            overlap: self.ingest_config.chunk_overlap_chars,
            min_join: self.ingest_config.chunk_min_join_chars,
            min_keep: self.ingest_config.chunk_min_keep_chars,
        };
        let chunks = document::chunk(
            ChunkStrategy::EmailFixed,
            &payload.subject,
            &normalized.plain_text,
            chunk_params,
        );

        let (n_chunks, doc_embedding) = if chunks.is_empty() {
            let seed = seed_string(&payload.subject, &normalized.plain_text);
            let vector = self.embed_with_retry(&seed).await?;
            (0, vector)
        } else {
            let vectors = self.embedding.embed_batch(&chunks).await?;
            self.repository.delete_chunks(document_id).await.map_err(CoreError::from)?;

            let pairs: Vec<(String, Vector)> = chunks
                .into_iter()
                .zip(vectors.clone())
                .map(|(text, vec)| (text, Vector::from(vec)))
                .collect();
            self.repository
                .insert_chunks(document_id, &pairs, lang_config)
                .await
                .map_err(CoreError::from)?;

            (pairs.len(), mean_vector(&vectors))
        };

        self.repository
            .update_document_embedding(document_id, &Vector::from(doc_embedding))
            .await
            .map_err(CoreError::from)?;

        Ok(IngestOutcome {
            ok: true,
            document_id,
            dedup: false,
            n_chunks,
            tags,
            lang: normalized.language,
        })
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        self.embedding.embed(text).await
    }

    /// Content-hash existence probe for `/ingest/gmail/exists` (§6: "200
    /// if a document with this content_hash exists"). Scoped to the
    /// caller's source unless `global_search` is set.
    pub async fn exists(
        &self,
        account_id: &str,
        content_hash: &str,
        global_search: bool,
    ) -> Result<Option<i32>, CoreError> {
        if global_search {
            return self
                .repository
                .find_document_by_hash_global(content_hash)
                .await
                .map_err(CoreError::from);
        }

        let Some(source_id) = self.repository.find_source_id(PROVIDER, account_id).await.map_err(CoreError::from)? else {
            return Ok(None);
        };

        self.repository
            .find_document_by_hash(source_id, content_hash)
            .await
            .map_err(CoreError::from)
    }
}

fn seed_string(subject: &str, plain_text: &str) -> String {
    if !subject.trim().is_empty() {
        return subject.trim().to_string();
    }
    let snippet = preview_of(plain_text);
    if !snippet.is_empty() {
        return snippet;
    }
    plain_text.chars().take(300).collect()
}

fn preview_of(plain_text: &str) -> String {
    plain_text.chars().take(300).collect()
}

fn non_empty(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn build_metadata(payload: &EmailPayload, normalized: &document::NormalizedEmail) -> Value {
    json!({
        "from_addr": payload.from_addr,
        "from_name": payload.from_name,
        "from_domain": normalized.sender_domain,
        "ts_parse_failed": normalized.ts_parse_failed,
        "language": normalized.language,
    })
}

fn mean_vector(vectors: &[Vec<f32>]) -> Vec<f32> {
    let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
    let mut sum = vec![0f32; dim];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len().max(1) as f32;
    for acc in sum.iter_mut() {
        *acc /= n;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_parses_single_object() {
        let body = r#"{"account_id":"u","external_id":"m1","subject":"Hi","plain_text":"Body"}"#;
        let parsed: IngestBoundaryPayload = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_items().len(), 1);
    }

    #[test]
    fn boundary_parses_items_wrapper() {
        let body = r#"{"items":[{"account_id":"u","external_id":"m1","plain_text":"Body"}]}"#;
        let parsed: IngestBoundaryPayload = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_items().len(), 1);
    }

    #[test]
    fn boundary_parses_raw_array() {
        let body = r#"[{"account_id":"u","external_id":"m1","plain_text":"Body"},{"account_id":"u","external_id":"m2","plain_text":"Other"}]"#;
        let parsed: IngestBoundaryPayload = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_items().len(), 2);
    }

    #[test]
    fn boundary_parses_doubly_nested_array() {
        let body = r#"[{"items":[{"account_id":"u","external_id":"m1","plain_text":"Body"}]}]"#;
        let parsed: IngestBoundaryPayload = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_items().len(), 1);
    }

    #[test]
    fn mean_vector_averages_componentwise() {
        let mean = mean_vector(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(mean, vec![2.0, 3.0]);
    }

    #[test]
    fn seed_string_prefers_subject() {
        assert_eq!(seed_string("Subject", "body"), "Subject");
        assert_eq!(seed_string("", "body text"), "body text");
    }
}
