pub mod ask_service;
pub mod embedding_service;
pub mod ingestor;
pub mod llm_service;
pub mod retriever;
pub mod tag_extractor;

pub use ask_service::AskService;
pub use embedding_service::EmbeddingService;
pub use ingestor::Ingestor;
pub use llm_service::LlmService;
pub use retriever::Retriever;
