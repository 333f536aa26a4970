use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Notifier;
use stepwise_core::types::RunEvent;

/// Appends one line per event to `<run_dir>/notifications.log`.
pub struct LogNotifier {
    path: PathBuf,
}

impl LogNotifier {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join("notifications.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, event: &RunEvent) -> BoxFuture<'_, Result<()>> {
        let line = format!(
            "[{}] [{}] {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            event.kind().as_str(),
            event.message()
        );

        Box::pin(async move {
            let io_err = |e: std::io::Error| StepwiseError::Notify {
                channel: "log".into(),
                message: e.to_string(),
            };
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(io_err)?;
            file.write_all(line.as_bytes()).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = LogNotifier::new(dir.path());

        notifier
            .notify(&RunEvent::StepFailed {
                step_id: "a".into(),
                error: "HTTP 400".into(),
            })
            .await
            .unwrap();
        notifier
            .notify(&RunEvent::RunCompleted {
                steps: 3,
                used_units: 10,
            })
            .await
            .unwrap();

        let content = std::fs::read_to_string(notifier.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[step_failed] Step a failed: HTTP 400"));
        assert!(lines[1].contains("[run_completed]"));
    }
}
