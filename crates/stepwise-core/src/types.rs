use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one orchestrator invocation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted status of a step. PENDING moves to DONE or FAILED and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the marker written to a step's `status` file.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "PENDING" => Some(Self::Pending),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-step record. Created on first dispatch, replaced atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub consumed_units: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// sha256 of the prompt this record was produced from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A fresh in-flight record.
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            consumed_units: 0,
            duration_ms: 0,
            prompt_path: None,
            response_path: None,
            error: None,
            prompt_hash: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Cumulative consumption for one accounting period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPeriod {
    pub period_key: String,
    pub used_units: u64,
}

impl BudgetPeriod {
    pub fn new(period_key: impl Into<String>) -> Self {
        Self {
            period_key: period_key.into(),
            used_units: 0,
        }
    }
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub step_id: String,
    pub prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub consumed_units: u64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Where a store placed the prompt and response of a transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptArtifacts {
    pub prompt_path: Option<PathBuf>,
    pub response_path: Option<PathBuf>,
}

/// Token usage reported by a completion provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Full response from a completion service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(Usage {
            input_tokens,
            output_tokens,
        });
        self
    }
}

/// Scheduler state for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    Complete,
    Stuck,
    BudgetExceeded,
    Interrupted,
}

impl RunState {
    /// Process exit code for a terminal state.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Running => 1,
            Self::Stuck => 3,
            Self::BudgetExceeded => 4,
            Self::Interrupted => 130,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Stuck => "STUCK",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::Interrupted => "INTERRUPTED",
        };
        f.write_str(s)
    }
}

/// Event categories a notifier can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEventKind {
    RunStarted,
    StepDispatched,
    StepCompleted,
    StepFailed,
    BudgetWarning,
    BudgetExceeded,
    Stuck,
    RunCompleted,
    RunInterrupted,
}

impl NotifyEventKind {
    /// Kinds delivered when a notifier has no explicit filter.
    pub fn lifecycle() -> &'static [NotifyEventKind] {
        &[
            Self::StepCompleted,
            Self::StepFailed,
            Self::BudgetWarning,
            Self::BudgetExceeded,
            Self::Stuck,
            Self::RunCompleted,
            Self::RunInterrupted,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::StepDispatched => "step_dispatched",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::BudgetWarning => "budget_warning",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Stuck => "stuck",
            Self::RunCompleted => "run_completed",
            Self::RunInterrupted => "run_interrupted",
        }
    }
}

/// Events emitted by the scheduler during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        total_steps: usize,
        already_resolved: usize,
        period_key: String,
    },
    StepDispatched {
        step_id: String,
    },
    StepCompleted {
        step_id: String,
        consumed_units: u64,
        duration_ms: u64,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    BudgetWarning {
        used_units: u64,
        limit_units: u64,
    },
    BudgetExceeded {
        used_units: u64,
        limit_units: u64,
        pending: Vec<String>,
    },
    Stuck {
        failed: Vec<String>,
        blocked: Vec<String>,
    },
    RunCompleted {
        steps: usize,
        used_units: u64,
    },
    RunInterrupted {
        pending: Vec<String>,
    },
}

impl RunEvent {
    pub fn kind(&self) -> NotifyEventKind {
        match self {
            Self::RunStarted { .. } => NotifyEventKind::RunStarted,
            Self::StepDispatched { .. } => NotifyEventKind::StepDispatched,
            Self::StepCompleted { .. } => NotifyEventKind::StepCompleted,
            Self::StepFailed { .. } => NotifyEventKind::StepFailed,
            Self::BudgetWarning { .. } => NotifyEventKind::BudgetWarning,
            Self::BudgetExceeded { .. } => NotifyEventKind::BudgetExceeded,
            Self::Stuck { .. } => NotifyEventKind::Stuck,
            Self::RunCompleted { .. } => NotifyEventKind::RunCompleted,
            Self::RunInterrupted { .. } => NotifyEventKind::RunInterrupted,
        }
    }

    /// Run-level events are logged at every verbosity; step events need level 2.
    pub fn is_run_level(&self) -> bool {
        !matches!(
            self,
            Self::StepDispatched { .. } | Self::StepCompleted { .. } | Self::StepFailed { .. }
        )
    }

    /// Short human-readable text for notification channels.
    pub fn message(&self) -> String {
        match self {
            Self::RunStarted {
                total_steps,
                already_resolved,
                ..
            } => format!(
                "Run started: {} steps ({} already resolved)",
                total_steps, already_resolved
            ),
            Self::StepDispatched { step_id } => format!("Step {} dispatched", step_id),
            Self::StepCompleted {
                step_id,
                consumed_units,
                duration_ms,
            } => format!(
                "Step {} done ({} units, {:.1}s)",
                step_id,
                consumed_units,
                *duration_ms as f64 / 1000.0
            ),
            Self::StepFailed { step_id, error } => format!("Step {} failed: {}", step_id, error),
            Self::BudgetWarning {
                used_units,
                limit_units,
            } => format!(
                "Budget warning: {}/{} units used ({}%)",
                used_units,
                limit_units,
                used_units.saturating_mul(100) / (*limit_units).max(1)
            ),
            Self::BudgetExceeded {
                used_units,
                limit_units,
                pending,
            } => format!(
                "Budget exceeded: {}/{} units used, {} steps left pending",
                used_units,
                limit_units,
                pending.len()
            ),
            Self::Stuck { failed, blocked } => {
                if failed.is_empty() {
                    format!("Run stuck: {} steps can never become ready", blocked.len())
                } else {
                    format!(
                        "Run stuck: failed [{}] blocking [{}]",
                        failed.join(", "),
                        blocked.join(", ")
                    )
                }
            }
            Self::RunCompleted { steps, used_units } => {
                format!("Run complete: {} steps, {} units this period", steps, used_units)
            }
            Self::RunInterrupted { pending } => {
                format!("Run interrupted with {} steps unresolved", pending.len())
            }
        }
    }
}
