use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::CompletionClient;
use stepwise_core::types::Completion;

/// What the mock answers for a matching prompt.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    TextWithUsage(String, u64, u64),
    Fail(String),
}

#[derive(Default)]
struct Inner {
    rules: Mutex<Vec<(String, MockReply)>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A scripted completion client.
///
/// Rules are matched in insertion order against the prompt (substring
/// match). Prompts matching no rule get `"ok: <first line>"`. Cloning shares
/// the script and the call log.
#[derive(Clone, Default)]
pub struct MockCompletionClient {
    inner: Arc<Inner>,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer prompts containing `needle` with `reply`.
    pub fn on(self, needle: impl Into<String>, reply: MockReply) -> Self {
        if let Ok(mut rules) = self.inner.rules.lock() {
            rules.push((needle.into(), reply));
        }
        self
    }

    /// Fail every prompt containing `needle`.
    pub fn failing_on(self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.on(needle, MockReply::Fail(message.into()))
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.inner.delay.lock() {
            *d = Some(delay);
        }
        self
    }

    /// Prompts received, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    /// Number of prompts received that contain `needle`.
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls().iter().filter(|p| p.contains(needle)).count()
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn reply_for(&self, prompt: &str) -> MockReply {
        let rules = match self.inner.rules.lock() {
            Ok(rules) => rules.clone(),
            Err(_) => Vec::new(),
        };
        rules
            .into_iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply)
            .unwrap_or_else(|| {
                MockReply::Text(format!("ok: {}", prompt.lines().next().unwrap_or_default()))
            })
    }
}

impl CompletionClient for MockCompletionClient {
    fn complete(&self, _config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.inner.calls.lock() {
                calls.push(prompt.clone());
            }
            let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = self.inner.delay.lock().ok().and_then(|d| *d);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.reply_for(&prompt) {
                MockReply::Text(text) => Ok(Completion::text(text)),
                MockReply::TextWithUsage(text, input, output) => {
                    Ok(Completion::text(text).with_usage(input, output))
                }
                MockReply::Fail(message) => Err(StepwiseError::CompletionRequest(message)),
            }
        })
    }
}
