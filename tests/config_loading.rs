use std::io::Write;
use std::path::PathBuf;

use stepwise_core::config::{AppConfig, BudgetPeriodKind, EstimatorKind, StoreBackend};
use stepwise_core::error::StepwiseError;
use stepwise_core::types::NotifyEventKind;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
base_url = "http://localhost:11434/v1/chat/completions"
max_tokens = 4096
temperature = 0.5
system_prompt = "Answer tersely."

[model.retry]
max_retries = 2
initial_backoff_ms = 10

[[fallback_models]]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"

[budget]
limit_units = 20000
period = "monthly"
warn_pct = 90
estimator = "bpe"

[run]
run_dir = "/tmp/stepwise-test"
max_parallel = 2
log_level = 1

[store]
backend = "sqlite"
sqlite_path = "/tmp/stepwise-test/custom.db"

[notify]
log = false
events = ["run_completed", "stuck"]
timeout_secs = 3

[notify.telegram]
bot_token = "123:BOT"
chat_id = "42"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_id, "gpt-4o-mini");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.model.system_prompt.as_deref(), Some("Answer tersely."));

    let retry = config.model.retry.as_ref().expect("retry present");
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 10);
    assert_eq!(retry.max_backoff_ms, 30000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "anthropic");

    assert_eq!(config.budget.limit_units, 20000);
    assert_eq!(config.budget.period, BudgetPeriodKind::Monthly);
    assert_eq!(config.budget.warn_pct, 90);
    assert_eq!(config.budget.estimator, EstimatorKind::Bpe);

    assert_eq!(config.run_dir(), PathBuf::from("/tmp/stepwise-test"));
    assert_eq!(config.run.max_parallel, 2);
    assert_eq!(config.run.log_level, 1);

    assert_eq!(config.store.backend, StoreBackend::Sqlite);
    assert_eq!(config.sqlite_path(), PathBuf::from("/tmp/stepwise-test/custom.db"));

    assert!(!config.notify.log);
    assert_eq!(
        config.notify.events,
        vec![NotifyEventKind::RunCompleted, NotifyEventKind::Stuck]
    );
    let telegram = config.notify.telegram.expect("telegram present");
    assert_eq!(telegram.chat_id, "42");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPWISE_TEST_WEBHOOK", "https://hooks.example.com/T000");

    let toml_content = r#"
[notify.webhook]
url = "${STEPWISE_TEST_WEBHOOK}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let webhook = config.notify.webhook.expect("webhook present");
    assert_eq!(webhook.url, "https://hooks.example.com/T000");

    std::env::remove_var("STEPWISE_TEST_WEBHOOK");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[budget]\nlimit_units = 100\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.budget.limit_units, 100);
    assert_eq!(config.budget.period, BudgetPeriodKind::Daily);
    assert_eq!(config.run.max_parallel, 1);
    assert_eq!(config.store.backend, StoreBackend::RunDir);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/stepwise.toml")).unwrap_err();
    assert!(matches!(err, StepwiseError::ConfigNotFound(_)));
    assert!(err.is_validation());

    let config =
        AppConfig::load_or_default(std::path::Path::new("/nonexistent/stepwise.toml")).unwrap();
    assert_eq!(config.run.run_dir, ".stepwise");
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[budget]\nwarn_pct = 150\n").expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(StepwiseError::Config(_))
    ));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[budget]\nperiod = \"weekly\"\n").expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(StepwiseError::Config(_))
    ));
}
