use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::CompletionClient;
use stepwise_core::types::Completion;

const MAX_STDERR_CHARS: usize = 2000;

/// Runs an external program as the completion service.
///
/// The prompt is written to the program's stdin and its stdout is the
/// response. A non-zero exit status is a failed call. `STEPWISE_MODEL` is set
/// to the configured model id so wrapper scripts can pick a model.
pub struct CommandClient;

impl CommandClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CommandClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionClient for CommandClient {
    fn complete(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        let argv = config.command.clone();
        let model_id = config.model_id.clone();

        Box::pin(async move {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| StepwiseError::Config("model.command is empty".into()))?;

            debug!(program = %program, "Spawning completion command");

            let mut child = tokio::process::Command::new(program)
                .args(args)
                .env("STEPWISE_MODEL", &model_id)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    StepwiseError::CompletionRequest(format!("failed to spawn {}: {}", program, e))
                })?;

            // Feed stdin from its own task so stdout and stderr drain concurrently
            let writer = child.stdin.take().map(|mut stdin| {
                tokio::spawn(async move {
                    let written = stdin.write_all(prompt.as_bytes()).await;
                    drop(stdin);
                    written
                })
            });

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| StepwiseError::CompletionRequest(e.to_string()))?;

            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
                return Err(StepwiseError::CompletionRequest(format!(
                    "{} exited with code {}: {}",
                    program, code, stderr
                )));
            }

            if let Some(writer) = writer {
                match writer.await {
                    Ok(Ok(())) => {}
                    // The program exited without reading; its status decides the outcome
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!(program = %program, "Completion command closed stdin early");
                    }
                    Ok(Err(e)) => return Err(StepwiseError::CompletionRequest(e.to_string())),
                    Err(e) => return Err(StepwiseError::CompletionRequest(e.to_string())),
                }
            }

            Ok(Completion::text(String::from_utf8_lossy(&output.stdout).into_owned()))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(argv: &[&str]) -> ModelConfig {
        ModelConfig {
            provider: "command".into(),
            command: argv.iter().map(|s| s.to_string()).collect(),
            ..ModelConfig::default()
        }
    }

    #[tokio::test]
    async fn echoes_stdin_as_response() {
        let client = CommandClient::new();
        let completion = client
            .complete(&config(&["cat"]), "ping".into())
            .await
            .unwrap();
        assert_eq!(completion.text, "ping");
        assert!(completion.usage.is_none());
    }

    #[tokio::test]
    async fn large_prompt_through_cat_does_not_block() {
        let client = CommandClient::new();
        let prompt = "0123456789abcdef".repeat(64 * 1024);
        let completion = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            client.complete(&config(&["cat"]), prompt.clone()),
        )
        .await
        .expect("cat should echo a 1 MiB prompt without stalling")
        .unwrap();
        assert_eq!(completion.text.len(), prompt.len());
        assert!(completion.text == prompt);
    }

    #[tokio::test]
    async fn exposes_model_to_program() {
        let client = CommandClient::new();
        let mut cfg = config(&["sh", "-c", "printf %s \"$STEPWISE_MODEL\""]);
        cfg.model_id = "local-model".into();
        let completion = client.complete(&cfg, String::new()).await.unwrap();
        assert_eq!(completion.text, "local-model");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let client = CommandClient::new();
        let err = client
            .complete(&config(&["sh", "-c", "echo boom >&2; exit 3"]), "x".into())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 3"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let client = CommandClient::new();
        let result = client
            .complete(&config(&["/nonexistent/stepwise-llm"]), "x".into())
            .await;
        assert!(matches!(result, Err(StepwiseError::CompletionRequest(_))));
    }

    #[tokio::test]
    async fn empty_command_is_config_error() {
        let client = CommandClient::new();
        let result = client.complete(&config(&[]), "x".into()).await;
        assert!(matches!(result, Err(StepwiseError::Config(_))));
    }
}
