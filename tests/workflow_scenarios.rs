use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stepwise_core::config::{AppConfig, StoreBackend};
use stepwise_core::event::EventBus;
use stepwise_core::types::{RunId, RunState, StepStatus};
use stepwise_engine::{load_workflow, RunLogger, RunReport, Scheduler};
use stepwise_notify::build_notifiers;
use stepwise_store::open_store;
use stepwise_test_utils::{
    temp_run_dir, test_config, write_workflow, MockCompletionClient, MockReply, CHAIN_WORKFLOW,
};

const FAN_OUT: &str = r#"
[[steps]]
id = "A"
prompt = "Step A: gather"

[[steps]]
id = "B"
prompt = "Step B: left"
depends_on = ["A"]

[[steps]]
id = "C"
prompt = "Step C: right"
depends_on = ["A"]
"#;

const CYCLE: &str = r#"
[[steps]]
id = "a"
prompt = "A"
depends_on = ["b"]

[[steps]]
id = "b"
prompt = "B"
depends_on = ["a"]
"#;

/// Wire a run the same way the binary does and wait for the event log.
async fn run(
    config: &AppConfig,
    workflow: &std::path::Path,
    client: &MockCompletionClient,
    period: &str,
) -> RunReport {
    let graph = load_workflow(workflow).unwrap();
    let run_dir = config.run_dir();
    let store = open_store(config, &run_dir).unwrap();
    let run_id = RunId::new();
    let bus = Arc::new(EventBus::default());
    let logger = RunLogger::new(&run_dir, config.run.log_level).spawn(
        &bus,
        run_id.clone(),
        CancellationToken::new(),
    );

    let report = Scheduler::new(graph, store, Arc::new(client.clone()), config, period)
        .with_run_id(run_id.clone())
        .with_event_bus(bus)
        .with_notifier(Arc::new(build_notifiers(config, &run_dir, &run_id)))
        .run()
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), logger)
        .await
        .unwrap()
        .unwrap();
    report
}

#[tokio::test]
async fn fan_out_completes_with_root_first() {
    let dir = temp_run_dir();
    let config = test_config(&dir.path().join("run"));
    let wf = write_workflow(dir.path(), "wf.toml", FAN_OUT);
    let client = MockCompletionClient::new();

    let report = run(&config, &wf, &client, "2026-05-01").await;

    assert_eq!(report.state, RunState::Complete);
    assert_eq!(report.dispatched[0], "A");
    let mut rest = report.dispatched[1..].to_vec();
    rest.sort();
    assert_eq!(rest, vec!["B", "C"]);

    let run_dir = config.run_dir();
    for id in ["A", "B", "C"] {
        let marker = std::fs::read_to_string(run_dir.join("steps").join(id).join("status")).unwrap();
        assert_eq!(marker.trim(), "DONE");
        assert!(run_dir.join("steps").join(id).join("response.md").exists());
    }
    let transcript = std::fs::read_to_string(run_dir.join("transcript.jsonl")).unwrap();
    assert_eq!(transcript.lines().count(), 3);
    let events = std::fs::read_to_string(run_dir.join("events.jsonl")).unwrap();
    assert!(events.lines().last().unwrap().contains("\"run_completed\""));
}

#[tokio::test]
async fn budget_below_root_consumption_leaves_children_pending() {
    let dir = temp_run_dir();
    let mut config = test_config(&dir.path().join("run"));
    config.budget.limit_units = 5;
    let wf = write_workflow(dir.path(), "wf.toml", FAN_OUT);
    let client = MockCompletionClient::new().on("Step A", MockReply::Text("y".repeat(200)));

    let report = run(&config, &wf, &client, "2026-05-01").await;

    assert_eq!(report.state, RunState::BudgetExceeded);
    assert_eq!(report.done, vec!["A"]);
    assert_eq!(report.pending, vec!["B", "C"]);
    assert_eq!(client.call_count(), 1);

    let store = open_store(&config, &config.run_dir()).unwrap();
    assert!(store.get("B").await.unwrap().is_none());
    assert!(store.get("C").await.unwrap().is_none());
    assert!(store.current_period_usage("2026-05-01").await.unwrap() > 5);
}

#[tokio::test]
async fn failing_root_is_stuck_and_child_never_attempted() {
    let dir = temp_run_dir();
    let mut config = test_config(&dir.path().join("run"));
    config.notify.log = true;
    let wf = write_workflow(
        dir.path(),
        "wf.toml",
        "[[steps]]\nid = \"A\"\nprompt = \"Step A\"\n\n[[steps]]\nid = \"B\"\nprompt = \"Step B\"\ndepends_on = [\"A\"]\n",
    );
    let client = MockCompletionClient::new().failing_on("Step A", "HTTP 400: bad request");

    let report = run(&config, &wf, &client, "2026-05-01").await;

    assert_eq!(report.state, RunState::Stuck);
    assert_eq!(report.failed, vec!["A"]);
    assert_eq!(report.blocked, vec!["B"]);
    assert_eq!(client.calls_containing("Step B"), 0);

    let store = open_store(&config, &config.run_dir()).unwrap();
    let a = store.get("A").await.unwrap().unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert!(a.error.unwrap().contains("HTTP 400"));
    assert!(store.get("B").await.unwrap().is_none());

    let notifications =
        std::fs::read_to_string(config.run_dir().join("notifications.log")).unwrap();
    assert!(notifications.contains("[step_failed]"));
    assert!(notifications.contains("Run stuck: failed [A] blocking [B]"));
}

#[tokio::test]
async fn cyclic_workflow_creates_no_state() {
    let dir = temp_run_dir();
    let wf = write_workflow(dir.path(), "wf.toml", CYCLE);

    let err = load_workflow(&wf).unwrap_err();
    assert!(err.is_validation());
    assert!(!dir.path().join("run").exists());
}

#[tokio::test]
async fn resume_after_restart_runs_each_step_once() {
    let dir = temp_run_dir();
    let mut config = test_config(&dir.path().join("run"));
    config.budget.limit_units = 20;
    let wf = write_workflow(dir.path(), "wf.toml", CHAIN_WORKFLOW);
    let client = MockCompletionClient::new().on("Step", MockReply::Text("z".repeat(60)));

    // Each step costs ~22 units, so each period admits exactly one
    let mut periods = Vec::new();
    for day in 1..=5 {
        let period = format!("2026-06-0{}", day);
        let report = run(&config, &wf, &client, &period).await;
        periods.push(report.state);
        if report.state == RunState::Complete {
            break;
        }
    }

    assert_eq!(
        periods,
        vec![
            RunState::BudgetExceeded,
            RunState::BudgetExceeded,
            RunState::Complete
        ]
    );
    for step in ["Step A", "Step B", "Step C"] {
        assert_eq!(client.calls_containing(step), 1, "{step}");
    }
}

#[tokio::test]
async fn sqlite_backend_runs_the_same_workflow() {
    let dir = temp_run_dir();
    let mut config = test_config(&dir.path().join("run"));
    config.store.backend = StoreBackend::Sqlite;
    let wf = write_workflow(dir.path(), "wf.toml", CHAIN_WORKFLOW);
    let client = MockCompletionClient::new();

    let first = run(&config, &wf, &client, "lifetime").await;
    assert_eq!(first.state, RunState::Complete);

    let second = run(&config, &wf, &client, "lifetime").await;
    assert!(second.dispatched.is_empty());
    assert_eq!(client.call_count(), 3);
    assert!(config.run_dir().join("state.db").exists());
}
