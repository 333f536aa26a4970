use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::CompletionClient;
use stepwise_core::types::Completion;

use crate::streaming::{collect_completion, Fragment, SseEvent, SseStream};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [ApiMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// Anthropic API stream event types
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum SseData {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageInfo },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaInfo },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<UsageInfo>,
    },
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageInfo {
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum DeltaInfo {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

fn parse_event(event: &SseEvent) -> Vec<Result<Fragment>> {
    let parsed: std::result::Result<SseData, _> = serde_json::from_str(&event.data);
    match parsed {
        Ok(SseData::MessageStart { message }) => match message.usage {
            Some(UsageInfo {
                input_tokens: Some(n),
                ..
            }) => vec![Ok(Fragment::InputTokens(n))],
            _ => vec![],
        },
        Ok(SseData::ContentBlockDelta {
            delta: DeltaInfo::TextDelta { text },
        }) => vec![Ok(Fragment::Text(text))],
        Ok(SseData::ContentBlockDelta { .. }) => vec![],
        Ok(SseData::MessageDelta { usage }) => {
            let mut out = Vec::new();
            if let Some(usage) = usage {
                debug!(
                    input_tokens = ?usage.input_tokens,
                    output_tokens = ?usage.output_tokens,
                    "Token usage"
                );
                if let Some(n) = usage.output_tokens {
                    out.push(Ok(Fragment::OutputTokens(n)));
                }
            }
            out
        }
        Ok(SseData::Error { error }) => vec![Err(StepwiseError::CompletionStream(error.message))],
        Ok(SseData::Other) => vec![],
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse Anthropic SSE data");
            vec![]
        }
    }
}

impl CompletionClient for AnthropicClient {
    fn complete(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let api_key = config
                .resolved_api_key()
                .ok_or_else(|| StepwiseError::Config("Anthropic API key not set".into()))?;

            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let body = MessagesRequest {
                model: &config.model_id,
                max_tokens: config.max_tokens,
                temperature: (config.temperature > 0.0).then_some(config.temperature),
                system: config.system_prompt.as_deref(),
                messages: [ApiMessage {
                    role: "user",
                    content: &prompt,
                }],
                stream: true,
            };

            let response = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| StepwiseError::CompletionRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(StepwiseError::CompletionRequest(format!(
                    "HTTP {}: {}",
                    status, body
                )));
            }

            let events = SseStream::new(response.bytes_stream());
            collect_completion(events, parse_event).await
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
    fn parses_text_delta() {
        let out = parse_event(&event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        ));
        assert!(matches!(&out[..], [Ok(Fragment::Text(t))] if t == "Hi"));
    }

    #[test]
    fn parses_usage_from_start_and_delta() {
        let start = parse_event(&event(
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":25,"output_tokens":1}}}"#,
        ));
        assert!(matches!(&start[..], [Ok(Fragment::InputTokens(25))]));

        let delta = parse_event(&event(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":15}}"#,
        ));
        assert!(matches!(&delta[..], [Ok(Fragment::OutputTokens(15))]));
    }

    #[test]
    fn ignores_unknown_events() {
        assert!(parse_event(&event(r#"{"type":"ping"}"#)).is_empty());
        assert!(parse_event(&event(r#"{"type":"content_block_stop","index":0}"#)).is_empty());
        assert!(parse_event(&event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"..."}}"#
        ))
        .is_empty());
    }

    #[test]
    fn stream_error_becomes_error() {
        let out = parse_event(&event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        assert!(matches!(&out[..], [Err(StepwiseError::CompletionStream(m))] if m == "Overloaded"));
    }

    #[test]
    fn request_shape() {
        let body = MessagesRequest {
            model: "claude-sonnet-4-20250514",
            max_tokens: 1024,
            temperature: None,
            system: Some("be brief"),
            messages: [ApiMessage {
                role: "user",
                content: "hello",
            }],
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["content"], "hello");
        assert_eq!(json["system"], "be brief");
        assert!(json.get("temperature").is_none());
    }
}
