use futures::future::BoxFuture;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Notifier;
use stepwise_core::types::{RunEvent, RunId};

/// Posts each event as JSON to a URL.
///
/// The body is `{"text": ..., "event": ..., "run_id": ...}`; `text` alone is
/// enough for Slack and Mattermost incoming webhooks.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    run_id: RunId,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, run_id: RunId) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            run_id,
        }
    }

    fn payload(&self, event: &RunEvent) -> serde_json::Value {
        serde_json::json!({
            "text": event.message(),
            "event": event.kind().as_str(),
            "run_id": self.run_id.to_string(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, event: &RunEvent) -> BoxFuture<'_, Result<()>> {
        let body = self.payload(event);
        Box::pin(async move {
            let err = |message: String| StepwiseError::Notify {
                channel: "webhook".into(),
                message,
            };
            let resp = self
                .http
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| err(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(err(format!("HTTP {}: {}", status, text)));
            }
            debug!(url = %self.url, "Webhook delivered");
            Ok(())
        })
    }
}
