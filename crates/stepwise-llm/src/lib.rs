pub mod providers;
pub mod retry;
pub mod streaming;
pub mod usage;

use stepwise_core::config::{AppConfig, ModelConfig};
use stepwise_core::traits::CompletionClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::command::CommandClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;
pub use usage::UsageEstimator;

/// Create a completion client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn CompletionClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        "command" => Box::new(CommandClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Build the client for a whole configuration, wrapping it with retries and
/// fallbacks when either is configured.
pub fn build_client(config: &AppConfig) -> Box<dyn CompletionClient> {
    let primary = create_client(&config.model);
    if config.model.retry.is_none() && config.fallback_models.is_empty() {
        return primary;
    }

    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    let retry = config.model.retry.clone().unwrap_or_else(|| stepwise_core::config::RetryConfig {
        max_retries: 0,
        ..Default::default()
    });
    Box::new(RetryingClient::new(primary, fallbacks, retry))
}
