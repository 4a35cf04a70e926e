pub mod settings;

pub use settings::{DatabaseConfig, EmbeddingConfig, IngestConfig, LlmConfig, RetrievalConfig, Settings};
