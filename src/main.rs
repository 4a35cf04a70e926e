use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, head, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

mod agents;
mod config;
mod database;
mod document;
mod handlers;
mod services;
mod state;
mod utils;

use agents::{AgentRegistry, IntentRouter};
use config::Settings;
use database::{DbPool, Repository};
use services::{AskService, EmbeddingService, Ingestor, LlmService, Retriever};
use state::AppState;
use utils::limiters::{Limiters, LimitsConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mindvault_core=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("starting mindvault core");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    info!("database connection established");

    let repository = Arc::new(Repository::new(db_pool.clone()));
    let limiters = Arc::new(Limiters::new(&LimitsConfig::default()));

    let embedding_service = Arc::new(EmbeddingService::new(
        settings.embedding.clone(),
        limiters.clone(),
        settings.ingest.retry_max,
        Duration::from_secs_f64(settings.ingest.retry_base_sleep_secs),
    ));

    let llm_service = Arc::new(LlmService::new(settings.llm.clone(), limiters.clone()));

    let ingestor = Arc::new(Ingestor::new(
        repository.clone(),
        embedding_service.clone(),
        llm_service.clone(),
        settings.ingest.clone(),
        settings.llm.clone(),
    ));

    let retriever = Arc::new(Retriever::new(
        repository.clone(),
        embedding_service.clone(),
        settings.retrieval.clone(),
        limiters.clone(),
    ));

    let ask_service = Arc::new(AskService::new(
        retriever.clone(),
        repository.clone(),
        llm_service.clone(),
        settings.llm.clone(),
    ));

    let intent_router = Arc::new(IntentRouter::new(llm_service.clone(), settings.llm.clone()));

    let agent_registry = Arc::new(build_agent_registry(
        retriever.clone(),
        repository.clone(),
        llm_service.clone(),
        settings.llm.clone(),
    ));

    let app_state = Arc::new(AppState {
        db_pool,
        repository,
        ingestor,
        retriever,
        ask_service,
        agent_registry,
        intent_router,
        settings: settings.clone(),
    });

    let app = build_router(app_state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// Wires the three built-in agents into the process-wide registry (4.J).
/// Each closure captures the `Arc` collaborators it needs and forwards to
/// the corresponding `agents::search_*::run` function.
fn build_agent_registry(
    retriever: Arc<Retriever>,
    repository: Arc<Repository>,
    llm: Arc<LlmService>,
    llm_config: config::LlmConfig,
) -> AgentRegistry {
    let find_retriever = retriever;
    let latest_repo = repository.clone();
    let summarize_repo = repository;

    AgentRegistry::builder()
        .register(
            "search.find",
            Box::new(move |params| {
                let retriever = find_retriever.clone();
                Box::pin(async move { agents::search_find::run(retriever, params).await })
            }),
        )
        .register(
            "search.latest_from",
            Box::new(move |params| {
                let repository = latest_repo.clone();
                Box::pin(async move { agents::search_latest_from::run(repository, params).await })
            }),
        )
        .register(
            "search.summarize",
            Box::new(move |params| {
                let repository = summarize_repo.clone();
                let llm = llm.clone();
                let llm_config = llm_config.clone();
                Box::pin(async move { agents::search_summarize::run(repository, llm, llm_config, params).await })
            }),
        )
        .build()
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/ingest/gmail", post(handlers::ingest::ingest_gmail))
        .route("/ingest/gmail/exists", head(handlers::ingest::ingest_gmail_exists))
        .route("/search", post(handlers::search::search_handler))
        .route("/ask", post(handlers::ask::ask_handler))
        .route("/agent/act", post(handlers::agent::agent_act))
        .route("/items/external", get(handlers::items::find_external_item))
        .layer(Extension(state))
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024))
}
