use super::{DbPool, DocumentSummary, HybridHit};
use anyhow::Result;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value as Json;
use sqlx::Row;

pub struct Repository {
    pool: DbPool,
}

/// Parameters for the hybrid ranking query of 4.H. `lang_config` is the
/// Postgres text-search configuration name (`turkish_unaccent` / `simple_unaccent`).
pub struct HybridSearchParams {
    pub query_text: String,
    pub lang_config: &'static str,
    pub query_embedding: Option<Vec<f32>>,
    pub tags: Vec<String>,
    pub boost_tags: Vec<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub decay_days: i32,
    pub highlight: bool,
    pub limit: i64,
    pub offset: i64,
}

pub struct LatestFromParams {
    pub sender: Option<String>,
    pub domain: Option<String>,
    pub limit: i64,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct LatestFromItem {
    pub id: i32,
    pub title: Option<String>,
    pub ts: Option<DateTime<Utc>>,
    pub provider: String,
    pub url: Option<String>,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_source(&self, provider: &str, account_id: &str) -> Result<i32> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (provider, account_id)
            VALUES ($1, $2)
            ON CONFLICT (provider, account_id) DO UPDATE SET provider = EXCLUDED.provider
            RETURNING id
            "#,
        )
        .bind(provider)
        .bind(account_id)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(row.get("id"))
    }

    /// Early-dedup lookup: does a document with this content_hash already exist
    /// in this source? Returns its id without touching chunks.
    pub async fn find_document_by_hash(
        &self,
        source_id: i32,
        content_hash: &str,
    ) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT id FROM documents WHERE source_id = $1 AND content_hash = $2")
            .bind(source_id)
            .bind(content_hash)
            .fetch_optional(self.pool.get_pool())
            .await?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Same existence check as `find_document_by_hash` but across every
    /// source, for `/ingest/gmail/exists?global_search=true`.
    pub async fn find_document_by_hash_global(&self, content_hash: &str) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT id FROM documents WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(self.pool.get_pool())
            .await?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Read-only source lookup; unlike `upsert_source`, never creates a
    /// row — an existence probe must not have the side effect of
    /// registering a source that has never ingested anything.
    pub async fn find_source_id(&self, provider: &str, account_id: &str) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT id FROM sources WHERE provider = $1 AND account_id = $2")
            .bind(provider)
            .bind(account_id)
            .fetch_optional(self.pool.get_pool())
            .await?;

        Ok(row.map(|r| r.get("id")))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_document(
        &self,
        source_id: i32,
        kind: &str,
        external_id: &str,
        title: Option<&str>,
        preview: Option<&str>,
        plain_text: &str,
        ts: DateTime<Utc>,
        source_url: Option<&str>,
        metadata: &Json,
        content_hash: &str,
    ) -> Result<i32> {
        let row = sqlx::query(
            r#"
            INSERT INTO documents
                (source_id, kind, external_id, title, preview, plain_text, ts, source_url, metadata, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_id, external_id) DO UPDATE SET
                title = EXCLUDED.title,
                preview = EXCLUDED.preview,
                plain_text = EXCLUDED.plain_text,
                ts = EXCLUDED.ts,
                source_url = EXCLUDED.source_url,
                metadata = EXCLUDED.metadata,
                content_hash = EXCLUDED.content_hash
            RETURNING id
            "#,
        )
        .bind(source_id)
        .bind(kind)
        .bind(external_id)
        .bind(title)
        .bind(preview)
        .bind(plain_text)
        .bind(ts)
        .bind(source_url)
        .bind(metadata)
        .bind(content_hash)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(row.get("id"))
    }

    pub async fn update_document_embedding(&self, document_id: i32, embedding: &Vector) -> Result<()> {
        sqlx::query("UPDATE documents SET embedding = $1 WHERE id = $2")
            .bind(embedding)
            .bind(document_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    pub async fn delete_chunks(&self, document_id: i32) -> Result<()> {
        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(())
    }

    /// Bulk-insert chunks for a document. `lang_config` drives the lexical
    /// index's `to_tsvector` call for each chunk's text.
    pub async fn insert_chunks(
        &self,
        document_id: i32,
        chunks: &[(String, Vector)],
        lang_config: &str,
    ) -> Result<()> {
        let mut tx = self.pool.get_pool().begin().await?;

        for (ord, (text, embedding)) in chunks.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO document_chunks (document_id, ord, text, embedding, lexical)
                VALUES ($1, $2, $3, $4, to_tsvector($5::regconfig, $3))
                "#,
            )
            .bind(document_id)
            .bind(ord as i32)
            .bind(text)
            .bind(embedding)
            .bind(lang_config)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_tags_and_attach(&self, document_id: i32, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.get_pool().begin().await?;

        for tag in tags {
            let row = sqlx::query(
                r#"
                INSERT INTO tags (name) VALUES ($1)
                ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(tag)
            .fetch_one(&mut *tx)
            .await?;
            let tag_id: i32 = row.get("id");

            sqlx::query(
                r#"
                INSERT INTO document_tags (document_id, tag_id) VALUES ($1, $2)
                ON CONFLICT (document_id, tag_id) DO NOTHING
                "#,
            )
            .bind(document_id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch documents by id, ordered newest-first; used by the ask engine
    /// and by `search.summarize`.
    pub async fn fetch_by_ids(&self, ids: &[i32]) -> Result<Vec<DocumentSummary>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let docs = sqlx::query_as::<_, DocumentSummary>(
            r#"
            SELECT d.id, s.provider, d.title, d.preview, d.plain_text, d.ts, d.source_url
            FROM documents d
            JOIN sources s ON s.id = d.source_id
            WHERE d.id = ANY($1)
            ORDER BY d.ts DESC NULLS LAST
            "#,
        )
        .bind(ids)
        .fetch_all(self.pool.get_pool())
        .await?;
        Ok(docs)
    }

    /// Existence probe for `/items/external`. Soft-deleted documents never
    /// count as found (9. Design Notes, Open Question (b)).
    pub async fn find_existing_external_id(
        &self,
        provider: &str,
        account_id: Option<&str>,
        external_id: &str,
    ) -> Result<Option<i32>> {
        let row = sqlx::query(
            r#"
            SELECT d.id
            FROM documents d
            JOIN sources s ON s.id = d.source_id
            WHERE s.provider = $1
              AND ($2::text IS NULL OR s.account_id = $2)
              AND d.external_id = $3
              AND d.deleted_at IS NULL
            "#,
        )
        .bind(provider)
        .bind(account_id)
        .bind(external_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(|r| r.get("id")))
    }

    /// The hybrid ranking query of 4.H: BM25 + cosine similarity + tag
    /// boost + linear time decay, deduplicated and paginated.
    ///
    /// Runs alongside `count_hybrid_matches` rather than folding the count
    /// into this query's own result set — a windowed `COUNT(*) OVER()`
    /// only survives on rows the page actually returns, so it silently
    /// reports 0 once `offset` runs past the end of the deduped matches.
    pub async fn hybrid_search(&self, params: &HybridSearchParams) -> Result<Vec<HybridHit>> {
        let qvec = params.query_embedding.clone().map(Vector::from);

        let hits = sqlx::query_as::<_, HybridHit>(
            r#"
            WITH scored AS (
                SELECT
                    d.id, d.title, d.preview, d.plain_text, d.ts, s.provider, d.source_url,
                    setweight(to_tsvector($1::regconfig, coalesce(d.title, '')), 'A') ||
                    setweight(to_tsvector($1::regconfig, coalesce(d.preview, '')), 'B') ||
                    setweight(to_tsvector($1::regconfig, coalesce(d.plain_text, '')), 'C') AS doc_fts,
                    websearch_to_tsquery($1::regconfig, $2) AS q_fts,
                    CASE
                        WHEN d.embedding IS NULL OR $3::vector IS NULL THEN 0.0
                        ELSE GREATEST(0.0, 1.0 - (d.embedding <=> $3::vector))
                    END AS vec_score,
                    CASE WHEN EXISTS (
                        SELECT 1 FROM document_tags dt
                        JOIN tags tg ON tg.id = dt.tag_id
                        WHERE dt.document_id = d.id AND tg.name = ANY($4)
                    ) THEN 1.0 ELSE 0.0 END AS tag_score,
                    GREATEST(0.0, 1.0 - (EXTRACT(EPOCH FROM (now() - d.ts)) / (86400.0 * $8))) AS decay_score
                FROM documents d
                JOIN sources s ON s.id = d.source_id
                WHERE d.deleted_at IS NULL
                  AND ($6::timestamptz IS NULL OR d.ts >= $6)
                  AND ($7::timestamptz IS NULL OR d.ts <= $7)
                  AND (
                    array_length($5::text[], 1) IS NULL OR EXISTS (
                        SELECT 1 FROM document_tags dt
                        JOIN tags tg ON tg.id = dt.tag_id
                        WHERE dt.document_id = d.id AND tg.name = ANY($5)
                    )
                  )
            ),
            ranked AS (
                SELECT *,
                    ts_rank_cd(doc_fts, q_fts, 32) AS bm25,
                    (0.55 * ts_rank_cd(doc_fts, q_fts, 32)
                        + 0.35 * vec_score
                        + 0.07 * tag_score
                        + 0.03 * decay_score) AS final_score,
                    CASE WHEN $9 THEN
                        ts_headline($1::regconfig, coalesce(plain_text, preview, ''), q_fts,
                            'StartSel=<mark>,StopSel=</mark>')
                    ELSE preview
                    END AS snippet
                FROM scored
                WHERE q_fts @@ doc_fts OR vec_score > 0.0
            ),
            deduped AS (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY title, preview
                    ORDER BY final_score DESC, ts DESC, length(plain_text) ASC
                ) AS rn
                FROM ranked
            )
            SELECT id, title, preview, plain_text, ts, provider, source_url, final_score, snippet
            FROM deduped
            WHERE rn = 1
            ORDER BY final_score DESC, ts DESC, length(plain_text) ASC
            LIMIT $10 OFFSET $11
            "#,
        )
        .bind(params.lang_config)
        .bind(&params.query_text)
        .bind(qvec)
        .bind(&params.boost_tags)
        .bind(&params.tags)
        .bind(params.date_from)
        .bind(params.date_to)
        .bind(params.decay_days as f64)
        .bind(params.highlight)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(hits)
    }

    /// Counts deduplicated matches for the same predicate `hybrid_search`
    /// uses, independent of `limit`/`offset` — the page and the total are
    /// two separate queries precisely so paging past the end still
    /// reports the real total.
    pub async fn count_hybrid_matches(&self, params: &HybridSearchParams) -> Result<i64> {
        let qvec = params.query_embedding.clone().map(Vector::from);

        let total: i64 = sqlx::query_scalar(
            r#"
            WITH scored AS (
                SELECT
                    d.id, d.title, d.preview,
                    setweight(to_tsvector($1::regconfig, coalesce(d.title, '')), 'A') ||
                    setweight(to_tsvector($1::regconfig, coalesce(d.preview, '')), 'B') ||
                    setweight(to_tsvector($1::regconfig, coalesce(d.plain_text, '')), 'C') AS doc_fts,
                    websearch_to_tsquery($1::regconfig, $2) AS q_fts,
                    CASE
                        WHEN d.embedding IS NULL OR $3::vector IS NULL THEN 0.0
                        ELSE GREATEST(0.0, 1.0 - (d.embedding <=> $3::vector))
                    END AS vec_score
                FROM documents d
                WHERE d.deleted_at IS NULL
                  AND ($5::timestamptz IS NULL OR d.ts >= $5)
                  AND ($6::timestamptz IS NULL OR d.ts <= $6)
                  AND (
                    array_length($4::text[], 1) IS NULL OR EXISTS (
                        SELECT 1 FROM document_tags dt
                        JOIN tags tg ON tg.id = dt.tag_id
                        WHERE dt.document_id = d.id AND tg.name = ANY($4)
                    )
                  )
            ),
            matched AS (
                SELECT id, title, preview FROM scored
                WHERE q_fts @@ doc_fts OR vec_score > 0.0
            ),
            deduped AS (
                SELECT ROW_NUMBER() OVER (PARTITION BY title, preview) AS rn
                FROM matched
            )
            SELECT COUNT(*) FROM deduped WHERE rn = 1
            "#,
        )
        .bind(params.lang_config)
        .bind(&params.query_text)
        .bind(qvec)
        .bind(&params.tags)
        .bind(params.date_from)
        .bind(params.date_to)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(total)
    }

    /// The `search.latest_from` query of 4.L.
    pub async fn latest_from(&self, params: &LatestFromParams) -> Result<Vec<LatestFromItem>> {
        let sender_pattern = params.sender.as_ref().map(|s| format!("%{}%", s.to_lowercase()));
        let domain_pattern = params.domain.as_ref().map(|d| format!("%{}%", d.to_lowercase()));
        let domain_at_pattern = params.domain.as_ref().map(|d| format!("%@{}", d.to_lowercase()));
        let domain_exact = params.domain.as_ref().map(|d| d.to_lowercase());

        let items = sqlx::query_as::<_, LatestFromItem>(
            r#"
            SELECT
                d.id,
                NULLIF(d.title, '') AS title,
                d.ts,
                s.provider,
                d.source_url AS url
            FROM documents d
            JOIN sources s ON s.id = d.source_id
            WHERE d.deleted_at IS NULL
              AND ($1::text IS NULL OR
                    lower(coalesce(d.metadata->>'from_name', '')) LIKE $1 OR
                    lower(coalesce(d.metadata->>'from_email', '')) LIKE $1 OR
                    lower(coalesce(d.metadata->>'display_name', '')) LIKE $1 OR
                    lower(coalesce(d.title, '')) LIKE $1 OR
                    lower(coalesce(d.preview, '')) LIKE $1)
              AND ($2::text IS NULL OR
                    lower(coalesce(d.source_url, '')) LIKE $2 OR
                    lower(coalesce(d.metadata->>'from_email', '')) LIKE $3 OR
                    lower(coalesce(d.metadata->>'from_domain', '')) = $4)
              AND ($5::timestamptz IS NULL OR d.ts >= $5)
              AND ($6::timestamptz IS NULL OR d.ts <= $6)
            ORDER BY d.ts DESC NULLS LAST
            LIMIT $7
            "#,
        )
        .bind(sender_pattern)
        .bind(domain_pattern)
        .bind(domain_at_pattern)
        .bind(domain_exact)
        .bind(params.date_from)
        .bind(params.date_to)
        .bind(params.limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(items)
    }
}
