use crate::config::LlmConfig;
use crate::utils::limiters::Limiters;
use crate::utils::CoreError;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: usize,
    pub json_mode: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

/// Non-streaming chat client (4.B). `complete` asks a given model for a
/// single completion; JSON mode requests a single JSON object and the
/// caller is expected to defensively parse it, including stripping a
/// fenced code block if the provider wraps its JSON in one.
pub struct LlmService {
    client: Client,
    config: LlmConfig,
    limiters: Arc<Limiters>,
}

impl LlmService {
    pub fn new(config: LlmConfig, limiters: Arc<Limiters>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .expect("failed to build LLM HTTP client"),
            config,
            limiters,
        }
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<String, CoreError> {
        self.complete_internal(model, messages, options)
            .await
            .map_err(Self::classify_error)
    }

    fn classify_error(err: anyhow::Error) -> CoreError {
        let lower = err.to_string().to_lowercase();
        if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
            CoreError::UpstreamAuth(err.to_string())
        } else if lower.contains("timeout") || lower.contains("503") || lower.contains("bad gateway") {
            CoreError::UpstreamTransient(err.to_string())
        } else {
            CoreError::Internal(err.to_string())
        }
    }

    async fn complete_internal(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<String> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.llm_generate.clone(),
            self.limiters.acquire_timeout,
            "llm_generate",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "llm_generate", "wait_queue");

        let request = ChatCompletionRequest {
            model,
            messages,
            max_tokens: if options.max_tokens > 0 {
                options.max_tokens
            } else {
                self.config.max_tokens
            },
            temperature: options.temperature,
            stream: false,
            response_format: options.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let mut builder = self.client.post(&url);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .context("failed to call chat completion API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat completion API error: {} - {}", status, body);
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("failed to parse chat completion response")?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat completion returned no choices"))
    }
}

/// Strips a fenced code block (```json ... ``` or ``` ... ```) around a
/// JSON payload before parsing, per 4.B's defensive-parsing requirement.
pub fn strip_json_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json_block() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_json_fence(raw), "{\"a\":1}");
    }

    #[test]
    fn leaves_bare_json_untouched() {
        let raw = "{\"a\":1}";
        assert_eq!(strip_json_fence(raw), "{\"a\":1}");
    }

    #[test]
    fn strips_plain_fence_without_language_tag() {
        let raw = "```\n{\"a\":1}\n```";
        assert_eq!(strip_json_fence(raw), "{\"a\":1}");
    }
}
