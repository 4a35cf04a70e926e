use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub ingest: IngestConfig,
    pub retrieval: RetrievalConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub local_embed: bool,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub intent_model: String,
    pub ask_chat_model: String,
    pub summary_model: String,
    pub tag_model: String,
    pub enable_oai_tags: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    pub chunk_target_chars: usize,
    pub chunk_overlap_chars: usize,
    pub chunk_min_join_chars: usize,
    pub chunk_min_keep_chars: usize,
    pub tag_text_budget: usize,
    pub retry_max: u32,
    pub retry_base_sleep_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    pub default_limit: i64,
    pub default_decay_days: i32,
    pub bm25_weight: f64,
    pub vec_weight: f64,
    pub tag_weight: f64,
    pub decay_weight: f64,
}

/// Kept for the benefit of the out-of-scope auth/CORS collaborator; never
/// read by the retrieval/ingest/ask core.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SecurityConfig {
    pub allowed_ips: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_bare_env_overrides();
        Ok(settings)
    }

    /// The bare, unprefixed variable names of 6. Environment take
    /// precedence over both `config/settings.toml` and the `APP__`
    /// prefixed source, matching how the reference server lets an
    /// operator override a single value without restating the whole
    /// `APP__` hierarchy.
    fn apply_bare_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.embedding.api_key = Some(v.clone());
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("EMBED_MODEL") {
            self.embedding.dimension = if v == "text-embedding-3-large" { 3072 } else { self.embedding.dimension };
            self.embedding.model = v;
        }
        set_usize(&mut self.embedding.dimension, "EMBED_DIM");
        set_bool(&mut self.embedding.local_embed, "LOCAL_EMBED");
        set_bool(&mut self.llm.enable_oai_tags, "ENABLE_OAI_TAGS");
        set_string(&mut self.llm.tag_model, "TAG_MODEL");
        set_usize(&mut self.ingest.tag_text_budget, "TAG_TEXT_BUDGET");
        set_usize(&mut self.ingest.chunk_target_chars, "CHUNK_TARGET_CHARS");
        set_usize(&mut self.ingest.chunk_overlap_chars, "CHUNK_OVERLAP_CHARS");
        set_usize(&mut self.ingest.chunk_min_join_chars, "CHUNK_MIN_JOIN_CHARS");
        set_usize(&mut self.ingest.chunk_min_keep_chars, "CHUNK_MIN_KEEP_CHARS");
        set_usize(&mut self.embedding.batch_size, "EMBED_BATCH");
        if let Ok(v) = std::env::var("RETRY_MAX") {
            if let Ok(parsed) = v.parse() {
                self.ingest.retry_max = parsed;
            }
        }
        if let Ok(v) = std::env::var("RETRY_BASE_SLEEP") {
            if let Ok(parsed) = v.parse() {
                self.ingest.retry_base_sleep_secs = parsed;
            }
        }
        set_string(&mut self.llm.intent_model, "INTENT_MODEL");
        set_string(&mut self.llm.ask_chat_model, "ASK_CHAT_MODEL");
        set_string(&mut self.llm.summary_model, "SUMMARY_MODEL");
    }
}

fn set_string(field: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *field = v;
    }
}

fn set_usize(field: &mut usize, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

fn set_bool(field: &mut bool, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}
