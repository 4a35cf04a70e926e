use crate::config::LlmConfig;
use crate::services::llm_service::{strip_json_fence, ChatMessage, CompletionOptions, LlmService};
use crate::services::retriever::clamp_decay_days;
use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub intent: Option<String>,
    pub params: Value,
    pub confidence: f64,
    pub reason: Option<String>,
    pub error: Option<String>,
}

impl RouteResult {
    fn no_match(reason: &str) -> Self {
        Self {
            intent: None,
            params: json!({}),
            confidence: 0.0,
            reason: Some(reason.to_string()),
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LlmRouteOutput {
    intent: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    confidence: f64,
    reason: Option<String>,
}

const CONFIDENCE_FLOOR: f64 = 0.3;

/// LLM-backed primary path with a regex TR/EN fallback when the chat
/// client is unavailable (4.K). `user_params`, when present, override
/// whatever the router itself extracted.
pub struct IntentRouter {
    llm: Arc<LlmService>,
    llm_config: LlmConfig,
}

impl IntentRouter {
    pub fn new(llm: Arc<LlmService>, llm_config: LlmConfig) -> Self {
        Self { llm, llm_config }
    }

    pub async fn route(&self, text: &str, allowed_agents: &[String], user_params: Option<Value>) -> RouteResult {
        let mut result = match self.route_via_llm(text, allowed_agents).await {
            Some(result) => result,
            None => self.route_via_fallback(text, allowed_agents),
        };

        if let Some(Value::Object(overrides)) = user_params {
            if let Value::Object(ref mut params) = result.params {
                for (k, v) in overrides {
                    params.insert(k, v);
                }
            }
        }

        result
    }

    async fn route_via_llm(&self, text: &str, allowed_agents: &[String]) -> Option<RouteResult> {
        let prompt = build_prompt(text, allowed_agents);
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user(text.to_string()),
        ];
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 300,
            json_mode: true,
        };

        let raw = self
            .llm
            .complete(&self.llm_config.intent_model, &messages, options)
            .await
            .ok()?;

        let parsed: LlmRouteOutput = serde_json::from_str(strip_json_fence(&raw)).ok()?;

        Some(validate_and_normalize(parsed, allowed_agents))
    }

    fn route_via_fallback(&self, text: &str, allowed_agents: &[String]) -> RouteResult {
        fallback_route(text, allowed_agents)
    }
}

fn build_prompt(_text: &str, allowed_agents: &[String]) -> String {
    format!(
        "You are an intent router. Allowed agents: {}. \
         Decision rule: if the text mentions both a sender/org AND a topic/keywords, choose search.find; \
         if it mentions only a sender/domain, choose search.latest_from; \
         if it references document ids, consider search.summarize. \
         Respond as JSON: {{\"intent\": <name or null>, \"params\": {{...}}, \"confidence\": <0..1>, \"reason\": <string>}}.",
        allowed_agents.join(", ")
    )
}

fn validate_and_normalize(parsed: LlmRouteOutput, allowed_agents: &[String]) -> RouteResult {
    let confidence = parsed.confidence.clamp(0.0, 1.0);

    let intent = parsed
        .intent
        .filter(|i| allowed_agents.iter().any(|a| a == i));

    if intent.is_none() || confidence < CONFIDENCE_FLOOR {
        return RouteResult::no_match("confidence below floor or intent not allowed");
    }

    let params = normalize_params(Value::Object(parsed.params), intent.as_deref().unwrap_or(""));

    RouteResult {
        intent,
        params,
        confidence,
        reason: parsed.reason,
        error: None,
    }
}

/// Per-field clamping and coercion applied to router output, regardless
/// of path (LLM or fallback): lowercase `sender`; strip leading `@` and
/// lowercase `domain`; clamp `limit`/`offset`/`decay_days`/
/// `date_window_days`; lowercase string-list fields dropping empties.
pub fn normalize_params(mut params: Value, intent: &str) -> Value {
    let Value::Object(ref mut map) = params else {
        return json!({});
    };

    if let Some(Value::String(sender)) = map.get("sender").cloned() {
        map.insert("sender".to_string(), json!(sender.to_lowercase()));
    }

    if let Some(Value::String(domain)) = map.get("domain").cloned() {
        let cleaned = domain.trim_start_matches('@').to_lowercase();
        map.insert("domain".to_string(), json!(cleaned));
    }

    if let Some(limit) = map.get("limit").and_then(Value::as_i64) {
        let max = if intent == "search.latest_from" { 50 } else { 200 };
        map.insert("limit".to_string(), json!(limit.clamp(1, max)));
    }

    if let Some(offset) = map.get("offset").and_then(Value::as_i64) {
        map.insert("offset".to_string(), json!(offset.max(0)));
    }

    if let Some(decay) = map.get("decay_days").and_then(Value::as_i64) {
        map.insert("decay_days".to_string(), json!(clamp_decay_days(decay as i32)));
    }

    if let Some(window) = map.get("date_window_days").and_then(Value::as_i64) {
        let clamped = window.clamp(1, 365);
        map.insert("date_window_days".to_string(), json!(clamped));
        let date_from = Utc::now() - ChronoDuration::days(clamped);
        map.insert("date_from".to_string(), json!(date_from.to_rfc3339()));
    }

    for field in ["keywords", "tags", "boost_tags"] {
        if let Some(Value::Array(items)) = map.get(field).cloned() {
            let normalized: Vec<Value> = items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_lowercase()))
                .filter(|s| !s.is_empty())
                .map(Value::String)
                .collect();
            map.insert(field.to_string(), Value::Array(normalized));
        }
    }

    Value::Object(map.clone())
}

static SENDER_POSSESSIVE_TR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\w+)'(?:dan|den) gelen").unwrap());
static SENDER_FROM_EN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bfrom\s+(\w+)").unwrap());
static SENDER_EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\w+)@(\S+)").unwrap());
static SENDER_EMAIL_WORD_EN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\w+)\s+email").unwrap());
static SENDER_EMAILS_TR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\w+)\s+(?:emailleri|mailler)").unwrap());
static TOPIC_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:ile ilgili|hakkında|about|konu:|topic:)\s*([\w çğıöşü]+)").unwrap()
});
static LIMIT_CUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:son|last)\s+(\d+)|(\d+)\s*tane").unwrap());
static EMAIL_CUE_TR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)e-?posta|mail|email").unwrap());
static EMAIL_CUE_EN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)email|mail").unwrap());

/// Regex-based TR/EN fallback used when the chat client is unavailable.
pub fn fallback_route(text: &str, allowed_agents: &[String]) -> RouteResult {
    let has_email_cue = EMAIL_CUE_TR.is_match(text) || EMAIL_CUE_EN.is_match(text);
    if !has_email_cue {
        return RouteResult::no_match("no email cue detected");
    }

    let sender = SENDER_POSSESSIVE_TR
        .captures(text)
        .or_else(|| SENDER_FROM_EN.captures(text))
        .or_else(|| SENDER_EMAIL_WORD_EN.captures(text))
        .or_else(|| SENDER_EMAILS_TR.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());

    let domain = SENDER_EMAIL.captures(text).and_then(|c| c.get(2)).map(|m| m.as_str().to_lowercase());

    let keywords: Vec<String> = TOPIC_CUE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().map(|w| w.to_lowercase()).collect())
        .unwrap_or_default();

    let limit = LIMIT_CUE
        .captures(text)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .and_then(|m| m.as_str().parse::<i64>().ok());

    let topic_present = !keywords.is_empty();
    let sender_present = sender.is_some() || domain.is_some();

    let intent = if sender_present && topic_present && allowed_agents.iter().any(|a| a == "search.find") {
        "search.find"
    } else if sender_present && allowed_agents.iter().any(|a| a == "search.latest_from") {
        "search.latest_from"
    } else {
        return RouteResult::no_match("no sender/topic pattern matched");
    };

    let mut params = Map::new();
    if let Some(sender) = &sender {
        params.insert("sender".to_string(), json!(sender));
    }
    if let Some(domain) = &domain {
        params.insert("domain".to_string(), json!(domain));
    }
    if !keywords.is_empty() {
        params.insert("keywords".to_string(), json!(keywords));
    }
    if let Some(limit) = limit {
        params.insert("limit".to_string(), json!(limit));
    }

    let normalized = normalize_params(Value::Object(params), intent);

    RouteResult {
        intent: Some(intent.to_string()),
        params: normalized,
        confidence: 0.6,
        reason: Some("regex fallback".to_string()),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["search.find".to_string(), "search.latest_from".to_string()]
    }

    #[test]
    fn fallback_routes_sender_and_topic_to_find() {
        let result = fallback_route("Bruce'dan gelen fare ile ilgili mail neydi?", &allowed());
        assert_eq!(result.intent.as_deref(), Some("search.find"));
        assert_eq!(result.params["sender"], json!("bruce"));
    }

    #[test]
    fn fallback_routes_sender_only_to_latest_from() {
        let result = fallback_route("HMRC'den gelen en son email neydi?", &allowed());
        assert_eq!(result.intent.as_deref(), Some("search.latest_from"));
    }

    #[test]
    fn fallback_routes_english_sender_and_topic() {
        let result = fallback_route("what was the email from jane about invoices", &allowed());
        assert_eq!(result.intent.as_deref(), Some("search.find"));
    }

    #[test]
    fn fallback_returns_none_without_email_cue() {
        let result = fallback_route("what's the weather today", &allowed());
        assert!(result.intent.is_none());
    }

    #[test]
    fn normalize_clamps_limit_for_latest_from() {
        let params = normalize_params(json!({"limit": 500}), "search.latest_from");
        assert_eq!(params["limit"], json!(50));
    }

    #[test]
    fn normalize_strips_leading_at_from_domain() {
        let params = normalize_params(json!({"domain": "@Example.com"}), "search.find");
        assert_eq!(params["domain"], json!("example.com"));
    }

    #[test]
    fn normalize_drops_empty_keywords() {
        let params = normalize_params(json!({"keywords": ["  ", "Invoice"]}), "search.find");
        assert_eq!(params["keywords"], json!(["invoice"]));
    }
}
