pub mod intent_router;
pub mod registry;
pub mod search_find;
pub mod search_latest_from;
pub mod search_summarize;

pub use intent_router::IntentRouter;
pub use registry::AgentRegistry;
