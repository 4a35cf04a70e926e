use crate::services::retriever::{Retriever, SearchQuery};
use serde_json::{json, Value};
use std::sync::Arc;

/// Free-text hybrid search exposed as an agent (the counterpart of §4.H
/// reachable through the router/registry rather than `/search`
/// directly).
pub async fn run(retriever: Arc<Retriever>, params: Value) -> Value {
    let query: SearchQuery = match serde_json::from_value(params) {
        Ok(v) => v,
        Err(e) => return json!({"error": format!("invalid params: {e}")}),
    };

    match retriever.search(query).await {
        Ok(response) => serde_json::to_value(response).unwrap_or(json!({"error": "serialization failed"})),
        Err(e) => json!({"error": e.to_string()}),
    }
}
