use axum::{extract::Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AgentActRequest {
    pub text: String,
    #[serde(default)]
    pub params: Option<Value>,
}

const NO_MATCH_MESSAGE: &str = "No matching agent in this step.";

/// `POST /agent/act` (6. External Interfaces; 4.J/4.K Agent layer).
/// Routes free text to one of the registered agents and dispatches it,
/// returning the chosen intent, the params actually used, and the
/// agent's result. Both "no intent matched" and "router named an
/// unregistered agent" are soft failures (7. Error Handling Design):
/// 200 with `intent: null` rather than a 4xx/5xx.
pub async fn agent_act(Extension(state): Extension<Arc<AppState>>, Json(request): Json<AgentActRequest>) -> Json<Value> {
    let allowed = state.agent_registry.names();
    let route = state.intent_router.route(&request.text, &allowed, request.params).await;

    let Some(intent) = route.intent.clone() else {
        return Json(json!({
            "intent": Value::Null,
            "params_used": route.params,
            "result": {"message": NO_MATCH_MESSAGE},
        }));
    };

    match state.agent_registry.dispatch(&intent, route.params.clone()).await {
        Some(result) => Json(json!({
            "intent": intent,
            "params_used": route.params,
            "result": result,
        })),
        None => Json(json!({
            "intent": Value::Null,
            "params_used": route.params,
            "result": {"message": NO_MATCH_MESSAGE},
        })),
    }
}
