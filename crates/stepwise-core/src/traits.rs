use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Completion service: sends one text payload, returns the full response.
pub trait CompletionClient: Send + Sync + 'static {
    /// Send the prompt and wait for the complete response text.
    fn complete(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>>;
}

/// Durable step and budget state.
///
/// Implementations must survive process restarts and replace records
/// atomically: a reader never observes a half-written record.
pub trait StateStore: Send + Sync + 'static {
    /// Load the record for a step, if one was ever written.
    fn get(&self, step_id: &str) -> BoxFuture<'_, Result<Option<StepRecord>>>;

    /// Atomically replace the record for `record.step_id`.
    fn put(&self, record: StepRecord) -> BoxFuture<'_, Result<()>>;

    /// All records currently stored, in no particular order.
    fn records(&self) -> BoxFuture<'_, Result<Vec<StepRecord>>>;

    /// Delete a step's record so it becomes eligible again. Returns whether one existed.
    fn remove(&self, step_id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Units used so far in the given accounting period (0 for a new period).
    fn current_period_usage(&self, period_key: &str) -> BoxFuture<'_, Result<u64>>;

    /// Atomically add `delta` to the period's usage and return the new total.
    fn add_period_usage(&self, period_key: &str, delta: u64) -> BoxFuture<'_, Result<u64>>;

    /// Persist a transcript entry and its prompt/response artifacts.
    fn record_transcript(
        &self,
        entry: &TranscriptEntry,
    ) -> BoxFuture<'_, Result<TranscriptArtifacts>>;

    /// Most recent successful response recorded for a step.
    fn response(&self, step_id: &str) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Outbound notification channel.
pub trait Notifier: Send + Sync + 'static {
    /// Channel name (e.g., "log", "webhook").
    fn name(&self) -> &str;

    /// Deliver one event. Callers treat failures as non-fatal.
    fn notify(&self, event: &RunEvent) -> BoxFuture<'_, Result<()>>;
}
