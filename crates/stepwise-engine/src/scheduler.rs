use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwise_core::config::AppConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::EventBus;
use stepwise_core::traits::{CompletionClient, Notifier, StateStore};
use stepwise_core::types::{RunEvent, RunId, RunState, StepStatus};
use stepwise_llm::UsageEstimator;

use crate::budget::{BudgetDecision, BudgetGuard};
use crate::executor::{StepExecutor, StepOutcome};
use crate::graph::{Step, TaskGraph};

/// Summary of one scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    /// Steps dispatched during this run, in dispatch order.
    pub dispatched: Vec<String>,
    pub done: Vec<String>,
    pub failed: Vec<String>,
    /// Unresolved steps that depend (transitively) on a FAILED step.
    pub blocked: Vec<String>,
    /// Every step neither DONE nor FAILED.
    pub pending: Vec<String>,
    pub used_units: u64,
    pub period_key: String,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }
}

/// Drives a validated graph to a terminal state.
///
/// Steps become ready when all their dependencies are DONE and are
/// dispatched in readiness order, at most `max_parallel` at a time. Every
/// dispatch passes the budget guard first.
pub struct Scheduler {
    graph: TaskGraph,
    store: Arc<dyn StateStore>,
    executor: StepExecutor,
    budget: Arc<BudgetGuard>,
    event_bus: Arc<EventBus>,
    notifier: Option<Arc<dyn Notifier>>,
    notify_drain: Duration,
    cancel: CancellationToken,
    run_id: RunId,
    max_parallel: usize,
}

impl Scheduler {
    pub fn new(
        graph: TaskGraph,
        store: Arc<dyn StateStore>,
        client: Arc<dyn CompletionClient>,
        config: &AppConfig,
        period_key: impl Into<String>,
    ) -> Self {
        let budget = Arc::new(BudgetGuard::from_config(
            store.clone(),
            &config.budget,
            period_key,
        ));
        let executor = StepExecutor::new(
            client,
            store.clone(),
            budget.clone(),
            config.model.clone(),
            UsageEstimator::from_config(&config.budget),
        );
        Self {
            graph,
            store,
            executor,
            budget,
            event_bus: Arc::new(EventBus::default()),
            notifier: None,
            notify_drain: Duration::from_secs(config.notify.timeout_secs.max(1)),
            cancel: CancellationToken::new(),
            run_id: RunId::new(),
            max_parallel: config.run.max_parallel.max(1),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// How long a finished run waits for queued notifications.
    pub fn with_notify_drain(mut self, drain: Duration) -> Self {
        self.notify_drain = drain;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Run until COMPLETE, STUCK, BUDGET_EXCEEDED, or INTERRUPTED.
    ///
    /// Step failures are part of the report; `Err` means the state store
    /// failed and the run could not continue.
    pub async fn run(&self) -> Result<RunReport> {
        let graph = &self.graph;
        let mut done: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();

        for record in self.store.records().await? {
            let Some(step) = graph.get(&record.step_id) else {
                debug!(step_id = %record.step_id, "Ignoring record for step not in workflow");
                continue;
            };
            match record.status {
                StepStatus::Done => {
                    if record
                        .prompt_hash
                        .as_deref()
                        .is_some_and(|h| h != step.prompt_hash())
                    {
                        warn!(
                            step_id = %step.id,
                            "Prompt changed since the step completed, keeping the recorded result"
                        );
                    }
                    done.insert(step.id.clone());
                }
                StepStatus::Failed => {
                    failed.insert(step.id.clone());
                }
                StepStatus::Pending => {
                    debug!(step_id = %step.id, "Step was interrupted, will re-dispatch");
                }
            }
        }

        let mut remaining: HashMap<&str, usize> = graph
            .steps()
            .iter()
            .map(|s| {
                let unresolved = s.depends_on.iter().filter(|d| !done.contains(*d)).count();
                (s.id.as_str(), unresolved)
            })
            .collect();
        let mut ready: VecDeque<&Step> = graph
            .steps()
            .iter()
            .filter(|s| {
                !done.contains(&s.id) && !failed.contains(&s.id) && remaining[s.id.as_str()] == 0
            })
            .collect();

        let notify = self.notifier.clone().map(NotifyQueue::spawn);
        let queue = notify.as_ref();

        let period_key = self.budget.period_key().to_string();
        info!(
            run_id = %self.run_id,
            steps = graph.len(),
            resolved = done.len() + failed.len(),
            period = %period_key,
            "Run started"
        );
        self.emit(queue, RunEvent::RunStarted {
            run_id: self.run_id.clone(),
            total_steps: graph.len(),
            already_resolved: done.len() + failed.len(),
            period_key: period_key.clone(),
        });
        if let Some(warning) = self.budget.take_warning(self.budget.used().await?) {
            self.emit(queue, warning);
        }

        let mut in_flight = FuturesUnordered::new();
        let mut dispatched: Vec<String> = Vec::new();
        let mut denied: Option<(u64, u64)> = None;
        let mut interrupted = false;

        loop {
            while denied.is_none() && !interrupted && in_flight.len() < self.max_parallel {
                if self.cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }
                let Some(step) = ready.pop_front() else {
                    break;
                };
                check_dispatch_limit(dispatched.len(), graph.len(), &step.id)?;

                let prompt = step.build_prompt(&self.dependency_outputs(step).await?);
                match self
                    .budget
                    .check_and_reserve(self.executor.estimate(&prompt))
                    .await?
                {
                    BudgetDecision::Deny { used, limit } => {
                        ready.push_front(step);
                        denied = Some((used, limit));
                        break;
                    }
                    BudgetDecision::Allow => {}
                }

                info!(step_id = %step.id, "Dispatching step");
                dispatched.push(step.id.clone());
                self.emit(queue, RunEvent::StepDispatched {
                    step_id: step.id.clone(),
                });

                let executor = &self.executor;
                in_flight.push(async move { (step, executor.execute(step, prompt).await) });
            }

            if in_flight.is_empty() {
                break;
            }

            let next = if interrupted {
                in_flight.next().await
            } else {
                tokio::select! {
                    next = in_flight.next() => next,
                    _ = self.cancel.cancelled() => {
                        interrupted = true;
                        info!(in_flight = in_flight.len(), "Interrupted, waiting for in-flight steps");
                        continue;
                    }
                }
            };
            let Some((step, result)) = next else {
                break;
            };
            let execution = result?;

            match execution.outcome {
                StepOutcome::Succeeded => {
                    done.insert(step.id.clone());
                    self.emit(queue, RunEvent::StepCompleted {
                        step_id: step.id.clone(),
                        consumed_units: execution.record.consumed_units,
                        duration_ms: execution.record.duration_ms,
                    });
                    for dependent in graph.dependents(&step.id) {
                        let Some(count) = remaining.get_mut(dependent.as_str()) else {
                            continue;
                        };
                        *count = count.saturating_sub(1);
                        if *count == 0 && !done.contains(dependent) && !failed.contains(dependent) {
                            if let Some(next_step) = graph.get(dependent) {
                                ready.push_back(next_step);
                            }
                        }
                    }
                }
                StepOutcome::Failed(error) => {
                    failed.insert(step.id.clone());
                    self.emit(queue, RunEvent::StepFailed {
                        step_id: step.id.clone(),
                        error,
                    });
                }
            }

            if let Some(warning) = self.budget.take_warning(execution.period_total) {
                self.emit(queue, warning);
            }
        }

        let used_units = self.budget.used().await?;
        let blocked_set = blocked_by_failures(graph, &failed, &done);
        let mut report = RunReport {
            run_id: self.run_id.clone(),
            state: RunState::Running,
            dispatched,
            done: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            pending: Vec::new(),
            used_units,
            period_key,
        };
        for step in graph.steps() {
            let id = step.id.clone();
            if done.contains(&id) {
                report.done.push(id);
            } else if failed.contains(&id) {
                report.failed.push(id);
            } else {
                if blocked_set.contains(&id) {
                    report.blocked.push(id.clone());
                }
                report.pending.push(id);
            }
        }

        report.state = if report.done.len() == graph.len() {
            RunState::Complete
        } else if interrupted {
            RunState::Interrupted
        } else if denied.is_some() {
            RunState::BudgetExceeded
        } else {
            RunState::Stuck
        };

        let terminal = match report.state {
            RunState::Complete => RunEvent::RunCompleted {
                steps: graph.len(),
                used_units,
            },
            RunState::BudgetExceeded => RunEvent::BudgetExceeded {
                used_units,
                limit_units: denied.map(|(_, limit)| limit).unwrap_or_default(),
                pending: report.pending.clone(),
            },
            RunState::Interrupted => RunEvent::RunInterrupted {
                pending: report.pending.clone(),
            },
            RunState::Stuck | RunState::Running => RunEvent::Stuck {
                failed: report.failed.clone(),
                blocked: report.blocked.clone(),
            },
        };
        info!(
            run_id = %self.run_id,
            state = %report.state,
            dispatched = report.dispatched.len(),
            done = report.done.len(),
            failed = report.failed.len(),
            used_units,
            "Run finished"
        );
        self.emit(queue, terminal);
        if let Some(notify) = notify {
            notify.close(self.notify_drain).await;
        }

        Ok(report)
    }

    /// Recorded responses of the step's dependencies, when it asks for them.
    async fn dependency_outputs(&self, step: &Step) -> Result<Vec<(String, String)>> {
        if !step.include_dependency_output {
            return Ok(Vec::new());
        }
        let mut outputs = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            match self.store.response(dep).await? {
                Some(text) => outputs.push((dep.clone(), text)),
                None => warn!(step_id = %step.id, dependency = %dep, "No recorded response for dependency"),
            }
        }
        Ok(outputs)
    }

    /// Publish on the bus and queue the notification.
    fn emit(&self, queue: Option<&NotifyQueue>, event: RunEvent) {
        self.event_bus.publish(event.clone());
        if let Some(queue) = queue {
            queue.send(event);
        }
    }
}

/// Delivers notifications in emission order on a background task so a slow
/// channel never holds up dispatch.
struct NotifyQueue {
    tx: mpsc::UnboundedSender<RunEvent>,
    task: JoinHandle<()>,
}

impl NotifyQueue {
    fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = notifier.notify(&event).await {
                    warn!(channel = notifier.name(), error = %e, "Notification failed");
                }
            }
        });
        Self { tx, task }
    }

    fn send(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            debug!("Notification task gone, dropping event");
        }
    }

    /// Wait up to `drain` for queued notifications, then abandon the rest.
    async fn close(self, drain: Duration) {
        let Self { tx, mut task } = self;
        drop(tx);
        if tokio::time::timeout(drain, &mut task).await.is_err() {
            warn!(
                drain_ms = drain.as_millis() as u64,
                "Notifications still queued after the run, abandoning them"
            );
            task.abort();
        }
    }
}

/// Each step is dispatched at most once per run.
fn check_dispatch_limit(dispatched: usize, total: usize, step_id: &str) -> Result<()> {
    if dispatched >= total {
        return Err(StepwiseError::Scheduler(format!(
            "dispatch limit of {} reached, refusing to re-dispatch {}",
            total, step_id
        )));
    }
    Ok(())
}

/// Unresolved steps reachable from a FAILED step through dependents.
fn blocked_by_failures(
    graph: &TaskGraph,
    failed: &HashSet<String>,
    done: &HashSet<String>,
) -> HashSet<String> {
    let mut blocked = HashSet::new();
    let mut queue: VecDeque<&str> = failed.iter().map(String::as_str).collect();
    while let Some(id) = queue.pop_front() {
        for dependent in graph.dependents(id) {
            if done.contains(dependent) || failed.contains(dependent) {
                continue;
            }
            if blocked.insert(dependent.clone()) {
                queue.push_back(dependent);
            }
        }
    }
    blocked
}
