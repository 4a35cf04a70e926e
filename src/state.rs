use std::sync::Arc;

use crate::agents::{AgentRegistry, IntentRouter};
use crate::config::Settings;
use crate::database::{DbPool, Repository};
use crate::services::{AskService, Ingestor, Retriever};

#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub repository: Arc<Repository>,
    pub ingestor: Arc<Ingestor>,
    pub retriever: Arc<Retriever>,
    pub ask_service: Arc<AskService>,
    pub agent_registry: Arc<AgentRegistry>,
    pub intent_router: Arc<IntentRouter>,
    pub settings: Settings,
}
