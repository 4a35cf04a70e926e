use crate::config::LlmConfig;
use crate::database::Repository;
use crate::services::llm_service::{ChatMessage, CompletionOptions, LlmService};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SummarizeParamsInput {
    pub doc_ids: Vec<i32>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub summary_type: SummaryType,
    #[serde(default = "default_max_docs")]
    pub max_docs: usize,
}

fn default_language() -> String {
    "tr".to_string()
}

fn default_max_docs() -> usize {
    10
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    #[default]
    Brief,
    Detailed,
    BulletPoints,
}

#[derive(Debug, Serialize)]
struct SourceRef {
    id: i32,
    title: Option<String>,
    url: Option<String>,
    reference: String,
}

#[derive(Debug, Serialize)]
struct SummarizeResult {
    summary: String,
    source_refs: Vec<SourceRef>,
    summary_type: &'static str,
    language: String,
    doc_count: usize,
}

/// Accepts `doc_ids`, fetches and trims each to 2000 chars, and asks the
/// chat client for a summary using `[Doc i]` references (4.M). Produces
/// a deterministic list-style fallback when the chat client is
/// unavailable rather than failing the request.
pub async fn run(repository: Arc<Repository>, llm: Arc<LlmService>, llm_config: LlmConfig, params: Value) -> Value {
    let input: SummarizeParamsInput = match serde_json::from_value(params) {
        Ok(v) => v,
        Err(e) => return json!({"error": format!("invalid params: {e}")}),
    };

    if input.doc_ids.is_empty() {
        return json!({"error": "doc_ids must not be empty"});
    }

    let max_docs = input.max_docs.clamp(1, 20);
    let ids: Vec<i32> = input.doc_ids.into_iter().take(max_docs).collect();

    let docs = match repository.fetch_by_ids(&ids).await {
        Ok(docs) => docs,
        Err(e) => return json!({"error": e.to_string()}),
    };

    let is_turkish = input.language == "tr";
    let type_label = match input.summary_type {
        SummaryType::Brief => "brief",
        SummaryType::Detailed => "detailed",
        SummaryType::BulletPoints => "bullet_points",
    };

    let source_refs: Vec<SourceRef> = docs
        .iter()
        .enumerate()
        .map(|(i, d)| SourceRef {
            id: d.id,
            title: d.title.clone(),
            url: d.source_url.clone(),
            reference: format!("Doc {}", i + 1),
        })
        .collect();

    let system = if is_turkish {
        format!("Belgeleri [Doc i] referanslarıyla {type_label} tarzında özetle.")
    } else {
        format!("Summarize the documents using [Doc i] references, {type_label} style.")
    };

    let user = docs
        .iter()
        .enumerate()
        .map(|(i, d)| format!("[Doc {}] {}", i + 1, truncate(&d.plain_text, 2000)))
        .collect::<Vec<_>>()
        .join("\n\n");

    let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    let options = CompletionOptions {
        temperature: 0.2,
        max_tokens: 500,
        json_mode: false,
    };

    let summary = match llm.complete(&llm_config.summary_model, &messages, options).await {
        Ok(text) => text,
        Err(_) => fallback_summary(&docs, is_turkish),
    };

    let result = SummarizeResult {
        summary,
        source_refs,
        summary_type: type_label,
        language: input.language,
        doc_count: docs.len(),
    };

    serde_json::to_value(result).unwrap_or(json!({"error": "serialization failed"}))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn fallback_summary(docs: &[crate::database::DocumentSummary], is_turkish: bool) -> String {
    let header = if is_turkish { "Belgeler:" } else { "Documents:" };
    let lines: Vec<String> = docs
        .iter()
        .enumerate()
        .map(|(i, d)| format!("[Doc {}] {}", i + 1, d.title.clone().unwrap_or_default()))
        .collect();
    format!("{header}\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_count() {
        let text = "a".repeat(3000);
        assert_eq!(truncate(&text, 2000).chars().count(), 2000);
    }
}
