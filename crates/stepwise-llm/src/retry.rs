use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use stepwise_core::config::{ModelConfig, RetryConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::CompletionClient;
use stepwise_core::types::Completion;

/// A completion client that retries transient failures and falls back to
/// alternative models. Requests the service rejects outright are not retried.
pub struct RetryingClient {
    primary: Box<dyn CompletionClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn CompletionClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn CompletionClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn CompletionClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

/// Status code from a provider error of the form `HTTP <code> ...`.
fn http_status(msg: &str) -> Option<u16> {
    let rest = msg.strip_prefix("HTTP ")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

pub(crate) fn is_retryable(e: &StepwiseError) -> bool {
    match e {
        StepwiseError::CompletionRequest(msg) => match http_status(msg) {
            Some(code) => matches!(code, 408 | 429 | 500 | 502 | 503 | 504 | 529),
            // Transport failures never reached the service
            None => {
                let lower = msg.to_lowercase();
                lower.starts_with("error sending request")
                    || lower.contains("timed out")
                    || lower.contains("connection refused")
                    || lower.contains("connection reset")
                    || lower.contains("connection closed")
            }
        },
        StepwiseError::CompletionStream(_) => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl CompletionClient for RetryingClient {
    fn complete(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.complete(&config, prompt.clone()).await {
                    Ok(completion) => return Ok(completion),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying completion request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Primary exhausted, try fallbacks
            if !self.fallbacks.is_empty() {
                info!("Primary model exhausted, trying fallback models");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                match fb_client.complete(fb_config, prompt.clone()).await {
                    Ok(completion) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(completion);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_config.model_id,
                            error = %e,
                            "Fallback model also failed"
                        );
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| StepwiseError::CompletionRequest("All providers failed".into())))
        })
    }
}
