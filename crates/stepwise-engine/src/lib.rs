pub mod budget;
pub mod executor;
pub mod graph;
pub mod run_log;
pub mod scheduler;

pub use budget::{period_key, BudgetDecision, BudgetGuard};
pub use executor::{StepExecution, StepExecutor, StepOutcome};
pub use graph::{load_workflow, Step, TaskGraph};
pub use run_log::RunLogger;
pub use scheduler::{RunReport, Scheduler};
