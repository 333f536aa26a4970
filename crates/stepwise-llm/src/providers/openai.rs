use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::CompletionClient;
use stepwise_core::types::Completion;

use crate::streaming::{collect_completion, Fragment, SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Default chat-completions endpoint for well-known OpenAI-compatible providers.
pub fn default_endpoint(provider: &str) -> &'static str {
    match provider {
        "ollama" => "http://localhost:11434/v1/chat/completions",
        "groq" => "https://api.groq.com/openai/v1/chat/completions",
        "openrouter" => "https://openrouter.ai/api/v1/chat/completions",
        "together" => "https://api.together.xyz/v1/chat/completions",
        "mistral" => "https://api.mistral.ai/v1/chat/completions",
        "deepseek" => "https://api.deepseek.com/v1/chat/completions",
        _ => OPENAI_API_URL,
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ChunkError {
    #[serde(default)]
    message: String,
}

fn build_messages<'a>(config: &'a ModelConfig, prompt: &'a str) -> Vec<OaiMessage<'a>> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = config.system_prompt.as_deref() {
        messages.push(OaiMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(OaiMessage {
        role: "user",
        content: prompt,
    });
    messages
}

fn parse_chunk(event: &SseEvent) -> Vec<Result<Fragment>> {
    let parsed: std::result::Result<StreamChunk, _> = serde_json::from_str(&event.data);
    match parsed {
        Ok(chunk) => {
            if let Some(err) = chunk.error {
                return vec![Err(StepwiseError::CompletionStream(err.message))];
            }

            let mut fragments = Vec::new();
            for choice in chunk.choices {
                if let Some(text) = choice.delta.and_then(|d| d.content) {
                    if !text.is_empty() {
                        fragments.push(Ok(Fragment::Text(text)));
                    }
                }
            }
            if let Some(usage) = chunk.usage {
                fragments.push(Ok(Fragment::InputTokens(usage.prompt_tokens)));
                fragments.push(Ok(Fragment::OutputTokens(usage.completion_tokens)));
            }
            fragments
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            vec![]
        }
    }
}

impl CompletionClient for OpenAiClient {
    fn complete(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| default_endpoint(&config.provider).to_string());

            let body = ChatRequest {
                model: &config.model_id,
                messages: build_messages(&config, &prompt),
                max_tokens: config.max_tokens,
                temperature: (config.temperature > 0.0).then_some(config.temperature),
                stream: true,
                stream_options: StreamOptions {
                    include_usage: true,
                },
            };

            let mut req = self.http.post(&base_url).json(&body);

            if let Some(api_key) = config.resolved_api_key() {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| StepwiseError::CompletionRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(StepwiseError::CompletionRequest(format!(
                    "HTTP {}: {}",
                    status, body
                )));
            }

            let events = SseStream::new(response.bytes_stream());
            collect_completion(events, parse_chunk).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn parses_content_delta() {
        let out = parse_chunk(&event(
            r#"{"choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        ));
        assert!(matches!(&out[..], [Ok(Fragment::Text(t))] if t == "Hello"));
    }

    #[test]
    fn parses_trailing_usage_chunk() {
        let out = parse_chunk(&event(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}}"#,
        ));
        assert!(matches!(
            &out[..],
            [Ok(Fragment::InputTokens(12)), Ok(Fragment::OutputTokens(30))]
        ));
    }

    #[test]
    fn finish_chunk_yields_nothing() {
        let out = parse_chunk(&event(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn inline_error_is_surfaced() {
        let out = parse_chunk(&event(r#"{"error":{"message":"rate limited"}}"#));
        assert!(matches!(&out[..], [Err(StepwiseError::CompletionStream(m))] if m == "rate limited"));
    }

    #[test]
    fn system_prompt_is_prepended() {
        let config = ModelConfig {
            system_prompt: Some("You are terse.".into()),
            ..ModelConfig::default()
        };
        let messages = build_messages(&config, "hi");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn preset_endpoints() {
        assert_eq!(
            default_endpoint("ollama"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(default_endpoint("openai"), OPENAI_API_URL);
        assert_eq!(default_endpoint("something-else"), OPENAI_API_URL);
    }
}
