use crate::config::EmbeddingConfig;
use crate::utils::limiters::Limiters;
use crate::utils::CoreError;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [&'a str],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

const TRANSIENT_MARKERS: &[&str] = &["timeout", "503", "bad gateway", "temporarily"];

/// Batched, retrying, dimension-checked embedding client (4.A). Batching
/// is capped at `EMBED_BATCH` texts per provider call; transient
/// failures retry with exponential backoff, dimension mismatches never
/// retry.
#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    dimension: usize,
    model_name: String,
    cache: Arc<RwLock<HashMap<String, Vec<f32>>>>,
    limiters: Arc<Limiters>,
    batch_size: usize,
    api_key: Option<String>,
    retry_max: u32,
    retry_base_sleep: Duration,
    local_embed: bool,
}

impl EmbeddingService {
    pub fn new(
        config: EmbeddingConfig,
        limiters: Arc<Limiters>,
        retry_max: u32,
        retry_base_sleep: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url,
            dimension: config.dimension,
            model_name: config.model,
            cache: Arc::new(RwLock::new(HashMap::new())),
            limiters,
            batch_size: config.batch_size.max(1),
            api_key: config.api_key,
            retry_max,
            retry_base_sleep,
            local_embed: config.local_embed,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        self.embed_internal(text)
            .await
            .map_err(Self::classify_error)
    }

    /// Sends at most `batch_size` texts per provider call (4.A), not one
    /// call per text — cached texts within a chunk are served from the
    /// cache and never sent.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let mut out = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(chunk).await.map_err(Self::classify_error)?);
        }

        Ok(out)
    }

    async fn embed_chunk(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; chunk.len()];
        let mut pending_idx = Vec::new();
        let mut pending_text = Vec::new();

        {
            let cache = self.cache.read().await;
            for (i, text) in chunk.iter().enumerate() {
                match cache.get(text) {
                    Some(v) => out[i] = Some(v.clone()),
                    None => {
                        pending_idx.push(i);
                        pending_text.push(text.as_str());
                    }
                }
            }
        }

        if !pending_text.is_empty() {
            let fetched = if self.local_embed {
                pending_text.iter().map(|t| pseudo_vector(t, self.dimension)).collect()
            } else {
                self.call_with_retry(&pending_text).await?
            };

            if fetched.len() != pending_text.len() {
                anyhow::bail!(
                    "embedding API returned {} vectors for {} inputs",
                    fetched.len(),
                    pending_text.len()
                );
            }
            for v in &fetched {
                self.check_dimension(v)?;
            }

            let mut cache = self.cache.write().await;
            for (text, vector) in pending_text.iter().zip(fetched.iter()) {
                cache.insert((*text).to_string(), vector.clone());
            }
            drop(cache);

            for (idx, vector) in pending_idx.into_iter().zip(fetched) {
                out[idx] = Some(vector);
            }
        }

        Ok(out.into_iter().map(|v| v.expect("every chunk position is filled")).collect())
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            anyhow::bail!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            );
        }
        Ok(())
    }

    fn classify_error(err: anyhow::Error) -> CoreError {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
            CoreError::UpstreamAuth(msg)
        } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            CoreError::UpstreamTransient(msg)
        } else {
            CoreError::Internal(msg)
        }
    }

    async fn embed_internal(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.read().await.get(text).cloned() {
            debug!("embedding cache hit");
            return Ok(cached);
        }

        if self.local_embed {
            let vector = pseudo_vector(text, self.dimension);
            self.cache.write().await.insert(text.to_string(), vector.clone());
            return Ok(vector);
        }

        let embeddings = self.call_with_retry(&[text]).await?;
        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding API returned no vectors"))?;
        self.check_dimension(&embedding)?;

        self.cache.write().await.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Acquires the `embedding` limiter once per provider call — one
    /// call may carry up to `batch_size` texts — and retries the whole
    /// call on a transient failure.
    async fn call_with_retry(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let mut attempt = 0;

        loop {
            match self.call_provider(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(err) => {
                    let lower = err.to_string().to_lowercase();
                    let transient = TRANSIENT_MARKERS.iter().any(|m| lower.contains(m));
                    if !transient || attempt >= self.retry_max {
                        return Err(err);
                    }
                    let sleep = self.retry_base_sleep.mul_f64(2f64.powi(attempt as i32));
                    debug!(attempt, sleep_ms = sleep.as_millis() as u64, "embedding retry");
                    tokio::time::sleep(sleep).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn call_provider(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let exec_start = Instant::now();
        let request = EmbeddingRequest {
            input: texts,
            model: &self.model_name,
        };

        let url = format!("{}/v1/embeddings", self.base_url);
        let mut builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .context("failed to connect to embedding server")?;

        debug!(exec_ms = exec_start.elapsed().as_millis() as u64, op = "embedding", "exec");

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding API error ({}): {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("failed to parse embedding response")?;

        if parsed.data.len() != texts.len() {
            anyhow::bail!(
                "embedding API returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            );
        }

        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.iter().any(|e| e.is_empty()) {
            anyhow::bail!("generated embedding vector is empty");
        }

        Ok(embeddings)
    }
}

/// Deterministic pseudo-vector for local development when no provider
/// credential is configured (4.A). Seeded from the sha256 of the text
/// rather than blake2b, since the teacher's dependency stack already
/// carries sha2 for content hashing and no other module needs blake2b.
fn pseudo_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(dimension);
    let mut counter: u64 = 0;

    while out.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();

        for chunk in digest.chunks(4) {
            if out.len() >= dimension {
                break;
            }
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let raw = u32::from_le_bytes(bytes);
            out.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        counter += 1;
    }

    let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in out.iter_mut() {
            *v /= norm;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_vector_is_deterministic_and_unit_normalized() {
        let a = pseudo_vector("hello world", 16);
        let b = pseudo_vector("hello world", 16);
        assert_eq!(a, b);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn pseudo_vector_differs_by_text() {
        let a = pseudo_vector("hello", 16);
        let b = pseudo_vector("world", 16);
        assert_ne!(a, b);
    }
}
