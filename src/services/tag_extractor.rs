use crate::services::llm_service::{strip_json_fence, ChatMessage, CompletionOptions, LlmService};
use serde::Deserialize;

const MAX_TAGS: usize = 5;

#[derive(Debug, Deserialize)]
struct TagsPayload {
    tags: Vec<String>,
}

/// Produces at most 5 lowercase topical tags from subject/body, budgeted
/// to `tag_text_budget` characters of input (4.F). Any failure — the
/// model unreachable, rate-limited, or returning unparseable JSON —
/// yields the empty list and never fails the ingest.
pub async fn extract_tags(
    llm: &LlmService,
    model: &str,
    enabled: bool,
    subject: &str,
    body: &str,
    text_budget: usize,
) -> Vec<String> {
    if !enabled {
        return Vec::new();
    }

    let budgeted: String = subject
        .chars()
        .chain(std::iter::once('\n'))
        .chain(body.chars())
        .take(text_budget)
        .collect();

    let messages = vec![
        ChatMessage::system(
            "Extract up to 5 short lowercase topical tags for this email. \
             Respond with a JSON object {\"tags\": [...]} and nothing else.",
        ),
        ChatMessage::user(budgeted),
    ];

    let options = CompletionOptions {
        temperature: 0.0,
        max_tokens: 200,
        json_mode: true,
    };

    let raw = match llm.complete(model, &messages, options).await {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };

    let parsed: TagsPayload = match serde_json::from_str(strip_json_fence(&raw)) {
        Ok(parsed) => parsed,
        Err(_) => return Vec::new(),
    };

    normalize_tags(parsed.tags)
}

/// Trim, lowercase, dedup, cap at 5 — idempotent by construction.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for tag in tags {
        let normalized = tag.trim().to_lowercase();
        if normalized.is_empty() || !seen.insert(normalized.clone()) {
            continue;
        }
        out.push(normalized);
        if out.len() >= MAX_TAGS {
            break;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_dedups_and_lowercases() {
        let tags = normalize_tags(vec![
            " Invoice ".to_string(),
            "invoice".to_string(),
            "Billing".to_string(),
        ]);
        assert_eq!(tags, vec!["invoice".to_string(), "billing".to_string()]);
    }

    #[test]
    fn normalize_caps_at_five() {
        let tags = normalize_tags((0..10).map(|i| format!("tag{i}")).collect());
        assert_eq!(tags.len(), 5);
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_tags(vec!["A".to_string(), "b".to_string(), "a".to_string()]);
        let twice = normalize_tags(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_drops_empty_after_trim() {
        let tags = normalize_tags(vec!["   ".to_string(), "real".to_string()]);
        assert_eq!(tags, vec!["real".to_string()]);
    }
}
