use std::collections::HashMap;
use std::fmt::Write;

use stepwise_core::types::{RunState, StepRecord, StepStatus};
use stepwise_engine::{RunReport, TaskGraph};

fn marker(record: Option<&StepRecord>) -> &'static str {
    match record.map(|r| r.status) {
        Some(StepStatus::Done) => "[DONE]",
        Some(StepStatus::Failed) => "[FAIL]",
        Some(StepStatus::Pending) => "[....]",
        None => "[    ]",
    }
}

/// Per-step status table plus period usage.
pub fn render_status(
    graph: &TaskGraph,
    records: &HashMap<String, StepRecord>,
    period_key: &str,
    used_units: u64,
    limit_units: u64,
) -> String {
    let width = graph.steps().iter().map(|s| s.id.len()).max().unwrap_or(0);
    let mut out = String::new();

    for step in graph.steps() {
        let record = records.get(&step.id);
        let _ = write!(out, "  {} {:<width$}", marker(record), step.id, width = width);
        match record {
            Some(r) if r.status == StepStatus::Done => {
                let _ = write!(
                    out,
                    "  {} units  {:.1}s",
                    r.consumed_units,
                    r.duration_ms as f64 / 1000.0
                );
            }
            Some(r) if r.status == StepStatus::Failed => {
                let _ = write!(out, "  {}", r.error.as_deref().unwrap_or("failed"));
            }
            Some(_) => out.push_str("  interrupted, will re-run"),
            None => {
                let waiting: Vec<&str> = step
                    .depends_on
                    .iter()
                    .filter(|d| {
                        records.get(d.as_str()).map(|r| r.status) != Some(StepStatus::Done)
                    })
                    .map(String::as_str)
                    .collect();
                if !waiting.is_empty() {
                    let _ = write!(out, "  waiting on {}", waiting.join(", "));
                }
            }
        }
        out.push('\n');
    }

    let done = graph
        .steps()
        .iter()
        .filter(|s| records.get(&s.id).map(|r| r.status) == Some(StepStatus::Done))
        .count();
    out.push('\n');
    let _ = writeln!(out, "  {}/{} steps done", done, graph.len());
    if limit_units > 0 {
        let _ = writeln!(
            out,
            "  Period {}: {}/{} units used",
            period_key, used_units, limit_units
        );
    } else {
        let _ = writeln!(out, "  Period {}: {} units used (no limit)", period_key, used_units);
    }
    out
}

/// Human summary of a finished run.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run {}: {}", report.run_id, report.state);
    let _ = writeln!(
        out,
        "  dispatched {}, done {}, failed {}, pending {}",
        report.dispatched.len(),
        report.done.len(),
        report.failed.len(),
        report.pending.len()
    );
    let _ = writeln!(
        out,
        "  period {}: {} units used",
        report.period_key, report.used_units
    );

    match report.state {
        RunState::Stuck => {
            if !report.failed.is_empty() {
                let _ = writeln!(out, "  failed: {}", report.failed.join(", "));
            }
            if !report.blocked.is_empty() {
                let _ = writeln!(out, "  blocked: {}", report.blocked.join(", "));
            }
            out.push_str("  Use `stepwise reset --failed` to retry failed steps.\n");
        }
        RunState::BudgetExceeded => {
            let _ = writeln!(out, "  left pending: {}", report.pending.join(", "));
            out.push_str("  Re-run in a new period or raise budget.limit_units.\n");
        }
        RunState::Interrupted => {
            let _ = writeln!(out, "  unresolved: {}", report.pending.join(", "));
        }
        RunState::Complete | RunState::Running => {}
    }
    out
}
