pub mod loader;
pub mod step;

pub use loader::{load_workflow, parse_workflow, validate_step_id, TaskGraph, WorkflowFormat};
pub use step::Step;
