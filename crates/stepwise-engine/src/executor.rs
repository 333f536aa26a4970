use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{CompletionClient, StateStore};
use stepwise_core::types::{StepRecord, StepStatus, TranscriptEntry};
use stepwise_llm::UsageEstimator;

use crate::budget::BudgetGuard;
use crate::graph::Step;

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
}

/// Everything a dispatch produced.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub record: StepRecord,
    pub entry: TranscriptEntry,
    pub outcome: StepOutcome,
    /// Period usage after this step's consumption was added.
    pub period_total: u64,
}

/// Runs one step against the completion service and persists the result.
pub struct StepExecutor {
    client: Arc<dyn CompletionClient>,
    store: Arc<dyn StateStore>,
    budget: Arc<BudgetGuard>,
    model: ModelConfig,
    estimator: UsageEstimator,
}

impl StepExecutor {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn StateStore>,
        budget: Arc<BudgetGuard>,
        model: ModelConfig,
        estimator: UsageEstimator,
    ) -> Self {
        Self {
            client,
            store,
            budget,
            model,
            estimator,
        }
    }

    /// Rough cost of sending `prompt`, used for the pre-dispatch budget check.
    pub fn estimate(&self, prompt: &str) -> u64 {
        self.estimator.text_units(prompt)
    }

    /// Execute `step` with the fully built `prompt`.
    ///
    /// A failed call is recorded FAILED and reported through the outcome;
    /// only store failures come back as `Err`.
    pub async fn execute(&self, step: &Step, prompt: String) -> Result<StepExecution> {
        let previous_attempts = self
            .store
            .get(&step.id)
            .await?
            .map(|r| r.attempts)
            .unwrap_or(0);

        let mut record = StepRecord::pending(&step.id);
        record.attempts = previous_attempts + 1;
        record.prompt_hash = Some(step.prompt_hash());
        self.store.put(record.clone()).await?;

        let started = Instant::now();
        let call = self.client.complete(&self.model, prompt.clone());
        let result = if self.model.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(self.model.timeout_secs), call).await {
                Ok(result) => result,
                Err(_) => Err(StepwiseError::CompletionTimeout(self.model.timeout_secs)),
            }
        } else {
            call.await
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (response, error, consumed_units) = match result {
            Ok(completion) => {
                let units = self
                    .estimator
                    .measure(&prompt, &completion.text, completion.usage);
                (completion.text, None, units)
            }
            // The request was sent, so the prompt still counts
            Err(e) => (String::new(), Some(e.to_string()), self.estimator.text_units(&prompt)),
        };

        let entry = TranscriptEntry {
            step_id: step.id.clone(),
            prompt,
            response,
            error: error.clone(),
            consumed_units,
            duration_ms,
            timestamp: Utc::now(),
        };
        let artifacts = self.store.record_transcript(&entry).await?;
        let period_total = self.budget.record(consumed_units).await?;

        record.consumed_units = consumed_units;
        record.duration_ms = duration_ms;
        record.prompt_path = artifacts.prompt_path;
        record.response_path = artifacts.response_path;
        record.finished_at = Some(Utc::now());
        let outcome = match error {
            None => {
                record.status = StepStatus::Done;
                info!(
                    step_id = %step.id,
                    units = consumed_units,
                    duration_ms,
                    period_total,
                    "Step done"
                );
                StepOutcome::Succeeded
            }
            Some(message) => {
                record.status = StepStatus::Failed;
                record.error = Some(message.clone());
                warn!(step_id = %step.id, error = %message, units = consumed_units, "Step failed");
                StepOutcome::Failed(message)
            }
        };
        self.store.put(record.clone()).await?;

        Ok(StepExecution {
            record,
            entry,
            outcome,
            period_total,
        })
    }
}
