use futures::future::BoxFuture;
use serde_json::Value;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Notifier;
use stepwise_core::types::RunEvent;

use crate::util::split_message;

const TELEGRAM_API: &str = "https://api.telegram.org";
const MAX_MESSAGE_CHARS: usize = 4096;

/// Sends events to a Telegram chat through the Bot API.
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: TELEGRAM_API.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let err = |message: String| StepwiseError::Notify {
            channel: "telegram".into(),
            message,
        };
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| err(format!("sendMessage failed: {}", e.without_url())))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| err(format!("Invalid sendMessage response: {}", e.without_url())))?;
        if !status.is_success() || body["ok"].as_bool() != Some(true) {
            let description = body["description"].as_str().unwrap_or("unknown error");
            return Err(err(format!("HTTP {}: {}", status, description)));
        }
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    fn notify(&self, event: &RunEvent) -> BoxFuture<'_, Result<()>> {
        let text = event.message();
        Box::pin(async move {
            for chunk in split_message(&text, MAX_MESSAGE_CHARS) {
                self.send_message(&chunk).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_test_utils::CaptureServer;

    #[tokio::test]
    async fn sends_to_chat() {
        let server = CaptureServer::start(200, r#"{"ok":true,"result":{}}"#).await;
        let notifier = TelegramNotifier::new("123:abc", "42").with_api_base(server.url(""));

        notifier
            .notify(&RunEvent::BudgetWarning {
                used_units: 80,
                limit_units: 100,
            })
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/bot123:abc/sendMessage");
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["chat_id"], "42");
        assert_eq!(body["text"], "Budget warning: 80/100 units used (80%)");
    }

    #[tokio::test]
    async fn api_rejection_is_an_error() {
        let server =
            CaptureServer::start(400, r#"{"ok":false,"description":"chat not found"}"#).await;
        let notifier = TelegramNotifier::new("t", "0").with_api_base(server.url(""));
        let err = notifier
            .notify(&RunEvent::RunInterrupted { pending: vec![] })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chat not found"), "{err}");
    }
}
