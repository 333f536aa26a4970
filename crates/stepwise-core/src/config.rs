use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StepwiseError};
use crate::types::NotifyEventKind;

/// Top-level stepwise configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Upper bound for a single completion call (0 = no limit).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Program and arguments for the `command` provider; the prompt is written to stdin.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: None,
            timeout_secs: default_timeout_secs(),
            command: Vec::new(),
            retry: None,
        }
    }
}

impl ModelConfig {
    /// The configured key, or the provider's conventional environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.starts_with("${")) {
            return Some(key.to_string());
        }
        let var = match self.provider.as_str() {
            "anthropic" | "claude" => "ANTHROPIC_API_KEY",
            "openai" => "OPENAI_API_KEY",
            "groq" => "GROQ_API_KEY",
            "openrouter" => "OPENROUTER_API_KEY",
            _ => return None,
        };
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_model_id() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }
fn default_timeout_secs() -> u64 { 600 }

/// Retry configuration for transient completion-service errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Length of an accounting period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriodKind {
    #[default]
    Daily,
    Monthly,
    Lifetime,
}

/// How consumption is measured for a completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorKind {
    /// Fixed characters-per-unit ratio over prompt and response.
    #[default]
    Chars,
    /// BPE token count (cl100k_base).
    Bpe,
    /// Provider-reported usage, falling back to `Chars` when absent.
    Reported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Units allowed per period (0 = unlimited).
    #[serde(default)]
    pub limit_units: u64,
    #[serde(default)]
    pub period: BudgetPeriodKind,
    /// Percentage of the limit at which a warning event is emitted.
    #[serde(default = "default_warn_pct")]
    pub warn_pct: u8,
    #[serde(default)]
    pub estimator: EstimatorKind,
    #[serde(default = "default_chars_per_unit")]
    pub chars_per_unit: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_units: 0,
            period: BudgetPeriodKind::default(),
            warn_pct: default_warn_pct(),
            estimator: EstimatorKind::default(),
            chars_per_unit: default_chars_per_unit(),
        }
    }
}

fn default_warn_pct() -> u8 { 80 }
fn default_chars_per_unit() -> u32 { 4 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding persisted run state. Relative paths resolve against the working directory.
    #[serde(default = "default_run_dir")]
    pub run_dir: String,
    /// Steps allowed in flight at once (1 = strictly sequential).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// events.jsonl verbosity: 0 = off, 1 = run events, 2 = run + step events.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            max_parallel: default_max_parallel(),
            log_level: default_log_level(),
        }
    }
}

fn default_run_dir() -> String { ".stepwise".to_string() }
fn default_max_parallel() -> usize { 1 }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    RunDir,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path for the sqlite backend. Default: <run_dir>/state.db
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Append notifications to <run_dir>/notifications.log.
    #[serde(default = "default_notify_log")]
    pub log: bool,
    /// Events to deliver (empty = lifecycle events).
    #[serde(default)]
    pub events: Vec<NotifyEventKind>,
    /// Upper bound for a single delivery.
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: default_notify_log(),
            events: Vec::new(),
            timeout_secs: default_notify_timeout(),
            webhook: None,
            telegram: None,
        }
    }
}

fn default_notify_log() -> bool { true }
fn default_notify_timeout() -> u64 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepwiseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.run.max_parallel == 0 {
            return Err(StepwiseError::Config("run.max_parallel must be at least 1".into()));
        }
        if self.budget.chars_per_unit == 0 {
            return Err(StepwiseError::Config("budget.chars_per_unit must be at least 1".into()));
        }
        if self.budget.warn_pct > 100 {
            return Err(StepwiseError::Config("budget.warn_pct must be between 0 and 100".into()));
        }
        if self.model.provider == "command" && self.model.command.is_empty() {
            return Err(StepwiseError::Config(
                "model.command is required for the command provider".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the run directory (expand ~).
    pub fn run_dir(&self) -> PathBuf {
        expand_home(&self.run.run_dir)
    }

    /// Resolve the sqlite database path for the sqlite backend.
    pub fn sqlite_path(&self) -> PathBuf {
        match &self.store.sqlite_path {
            Some(p) => expand_home(p),
            None => self.run_dir().join("state.db"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var_name = &after[..end];
                match std::env::var(var_name) {
                    Ok(val) => result.push_str(&val),
                    // Keep original if env var not set
                    Err(_) => result.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
