use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use stepwise_core::event::EventBus;
use stepwise_core::types::{RunEvent, RunId};

/// JSONL event log at `<run_dir>/events.jsonl`.
///
/// Level 1 records run-level events, level 2 adds per-step events, level 0
/// disables the log. Each line is flushed as it is written.
pub struct RunLogger {
    path: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run: &'a str,
    #[serde(flatten)]
    event: &'a RunEvent,
}

fn is_terminal(event: &RunEvent) -> bool {
    matches!(
        event,
        RunEvent::RunCompleted { .. }
            | RunEvent::Stuck { .. }
            | RunEvent::BudgetExceeded { .. }
            | RunEvent::RunInterrupted { .. }
    )
}

impl RunLogger {
    pub fn new(run_dir: &Path, level: u8) -> Self {
        Self {
            path: run_dir.join("events.jsonl"),
            level,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wants(&self, event: &RunEvent) -> bool {
        match self.level {
            0 => false,
            1 => event.is_run_level(),
            _ => true,
        }
    }

    /// Subscribe now and write in the background until the run's terminal
    /// event or cancellation.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    async fn run(self, mut rx: Receiver<RunEvent>, run_id: RunId, cancel: CancellationToken) {
        if self.level == 0 {
            return;
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "Failed to open event log");
                return;
            }
        };
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            let event = tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Run logger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => {
                    debug!("Run logger cancelled");
                    break;
                }
            };

            if self.wants(&event) {
                let entry = LogEntry {
                    timestamp: Utc::now().to_rfc3339(),
                    run: &run_id.0,
                    event: &event,
                };
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write event log entry");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "Failed to flush event log");
                    }
                }
            }

            if is_terminal(&event) {
                break;
            }
        }

        writer.flush().await.ok();
        debug!(path = %self.path.display(), "Run logger finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<RunEvent> {
        vec![
            RunEvent::RunStarted {
                run_id: RunId::from_string("r1"),
                total_steps: 1,
                already_resolved: 0,
                period_key: "p".into(),
            },
            RunEvent::StepDispatched { step_id: "a".into() },
            RunEvent::StepCompleted {
                step_id: "a".into(),
                consumed_units: 2,
                duration_ms: 5,
            },
            RunEvent::RunCompleted {
                steps: 1,
                used_units: 2,
            },
        ]
    }

    async fn log_at(level: u8) -> Vec<serde_json::Value> {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let logger = RunLogger::new(dir.path(), level);
        let path = logger.path().to_path_buf();
        let handle = logger.spawn(&bus, RunId::from_string("r1"), CancellationToken::new());

        for event in events() {
            bus.publish(event);
        }
        handle.await.unwrap();

        std::fs::read_to_string(&path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn level_two_logs_everything() {
        let lines = log_at(2).await;
        let kinds: Vec<_> = lines.iter().map(|l| l["event"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["run_started", "step_dispatched", "step_completed", "run_completed"]
        );
        assert_eq!(lines[2]["step_id"], "a");
        assert_eq!(lines[1]["run"], "r1");
    }

    #[tokio::test]
    async fn level_one_skips_step_events() {
        let lines = log_at(1).await;
        let kinds: Vec<_> = lines.iter().map(|l| l["event"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["run_started", "run_completed"]);
    }

    #[tokio::test]
    async fn level_zero_writes_nothing() {
        assert!(log_at(0).await.is_empty());
    }
}
