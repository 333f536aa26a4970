use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Notifier;
use stepwise_core::types::RunEvent;

/// Records every event it receives. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<RunEvent>>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            events: Arc::default(),
            delay: Some(delay),
        }
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    fn notify(&self, event: &RunEvent) -> BoxFuture<'_, Result<()>> {
        let event = event.clone();
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
            Ok(())
        })
    }
}

/// Fails every delivery.
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn name(&self) -> &str {
        "failing"
    }

    fn notify(&self, _event: &RunEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            Err(StepwiseError::Notify {
                channel: "failing".into(),
                message: "channel unavailable".into(),
            })
        })
    }
}
