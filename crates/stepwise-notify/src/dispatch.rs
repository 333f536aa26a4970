use std::path::Path;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use stepwise_core::config::{AppConfig, NotifyConfig};
use stepwise_core::error::Result;
use stepwise_core::traits::Notifier;
use stepwise_core::types::{NotifyEventKind, RunEvent, RunId};

use crate::{LogNotifier, TelegramNotifier, WebhookNotifier};

/// Fans an event out to every configured channel.
///
/// Events outside the filter are dropped. Each delivery is bounded by the
/// timeout; failures are logged and never reach the caller.
pub struct NotifierSet {
    notifiers: Vec<Box<dyn Notifier>>,
    events: Vec<NotifyEventKind>,
    timeout: Duration,
}

impl NotifierSet {
    pub fn new(
        notifiers: Vec<Box<dyn Notifier>>,
        events: Vec<NotifyEventKind>,
        timeout: Duration,
    ) -> Self {
        Self {
            notifiers,
            events,
            timeout,
        }
    }

    pub fn from_config(config: &NotifyConfig, notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self::new(
            notifiers,
            config.events.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Channel names, in delivery order.
    pub fn names(&self) -> Vec<&str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    /// Whether events of this kind pass the filter (empty filter = lifecycle events).
    pub fn wants(&self, kind: NotifyEventKind) -> bool {
        if self.events.is_empty() {
            NotifyEventKind::lifecycle().contains(&kind)
        } else {
            self.events.contains(&kind)
        }
    }

    async fn deliver(&self, notifier: &dyn Notifier, event: &RunEvent) {
        match tokio::time::timeout(self.timeout, notifier.notify(event)).await {
            Ok(Ok(())) => debug!(channel = notifier.name(), event = event.kind().as_str(), "Notified"),
            Ok(Err(e)) => warn!(channel = notifier.name(), error = %e, "Notification failed"),
            Err(_) => warn!(
                channel = notifier.name(),
                timeout_secs = self.timeout.as_secs(),
                "Notification timed out"
            ),
        }
    }
}

impl Notifier for NotifierSet {
    fn name(&self) -> &str {
        "set"
    }

    fn notify(&self, event: &RunEvent) -> BoxFuture<'_, Result<()>> {
        let event = event.clone();
        Box::pin(async move {
            if !self.wants(event.kind()) {
                return Ok(());
            }
            join_all(self.notifiers.iter().map(|n| self.deliver(n.as_ref(), &event))).await;
            Ok(())
        })
    }
}

/// Build the channels enabled in `[notify]` for a run.
pub fn build_notifiers(config: &AppConfig, run_dir: &Path, run_id: &RunId) -> NotifierSet {
    let notify = &config.notify;
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

    if notify.log {
        notifiers.push(Box::new(LogNotifier::new(run_dir)));
    }
    if let Some(webhook) = &notify.webhook {
        if webhook.url.is_empty() {
            warn!("notify.webhook.url is empty, webhook disabled");
        } else {
            notifiers.push(Box::new(WebhookNotifier::new(&webhook.url, run_id.clone())));
        }
    }
    if let Some(telegram) = &notify.telegram {
        if telegram.bot_token.is_empty() || telegram.chat_id.is_empty() {
            warn!("notify.telegram needs bot_token and chat_id, telegram disabled");
        } else {
            notifiers.push(Box::new(TelegramNotifier::new(
                &telegram.bot_token,
                &telegram.chat_id,
            )));
        }
    }

    NotifierSet::from_config(notify, notifiers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::config::{TelegramConfig, WebhookConfig};
    use stepwise_test_utils::{FailingNotifier, RecordingNotifier};

    fn completed() -> RunEvent {
        RunEvent::RunCompleted {
            steps: 1,
            used_units: 5,
        }
    }

    #[tokio::test]
    async fn default_filter_drops_step_dispatch() {
        let recorder = RecordingNotifier::new();
        let set = NotifierSet::new(
            vec![Box::new(recorder.clone())],
            vec![],
            Duration::from_secs(1),
        );

        set.notify(&RunEvent::StepDispatched { step_id: "a".into() })
            .await
            .unwrap();
        set.notify(&completed()).await.unwrap();

        let kinds: Vec<_> = recorder.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![NotifyEventKind::RunCompleted]);
    }

    #[tokio::test]
    async fn explicit_filter_is_exact() {
        let recorder = RecordingNotifier::new();
        let set = NotifierSet::new(
            vec![Box::new(recorder.clone())],
            vec![NotifyEventKind::StepDispatched],
            Duration::from_secs(1),
        );

        set.notify(&RunEvent::StepDispatched { step_id: "a".into() })
            .await
            .unwrap();
        set.notify(&completed()).await.unwrap();

        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_others_still_receive() {
        let recorder = RecordingNotifier::new();
        let set = NotifierSet::new(
            vec![Box::new(FailingNotifier), Box::new(recorder.clone())],
            vec![],
            Duration::from_secs(1),
        );

        assert!(set.notify(&completed()).await.is_ok());
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn slow_channel_times_out() {
        let set = NotifierSet::new(
            vec![Box::new(RecordingNotifier::with_delay(Duration::from_secs(5)))],
            vec![],
            Duration::from_millis(20),
        );
        let started = std::time::Instant::now();
        assert!(set.notify(&completed()).await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn builds_enabled_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.notify.webhook = Some(WebhookConfig {
            url: "http://localhost:9/hook".into(),
        });
        config.notify.telegram = Some(TelegramConfig {
            bot_token: String::new(),
            chat_id: "1".into(),
        });

        let set = build_notifiers(&config, dir.path(), &RunId::new());
        assert_eq!(set.names(), vec!["log", "webhook"]);

        config.notify.log = false;
        config.notify.webhook = None;
        assert!(build_notifiers(&config, dir.path(), &RunId::new()).is_empty());
    }
}
