use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configured permit counts for the named semaphores of 5. Concurrency &
/// Resource Model. Not part of `Settings` because it has no on-disk
/// section of its own in the teacher's config layout; callers build it
/// from fixed defaults or environment overrides at startup.
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub db_search_concurrency: usize,
    pub llm_generate_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            embedding_concurrency: 8,
            db_search_concurrency: 16,
            llm_generate_concurrency: 4,
            acquire_timeout_ms: 10_000,
        }
    }
}

/// Bounded concurrency gates for outbound work. Only three named
/// semaphores remain: no chat-streaming endpoint survives in scope, so
/// the teacher's fourth (`llm_stream`) has no caller left.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub db_search: Arc<Semaphore>,
    pub llm_generate: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            db_search: Arc::new(Semaphore::new(cfg.db_search_concurrency.max(1))),
            llm_generate: Arc::new(Semaphore::new(cfg.llm_generate_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}
