use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};

use super::step::Step;

/// On-disk workflow description.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    steps: Vec<StepDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDef {
    id: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    prompt_file: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    include_dependency_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Toml,
    Json,
}

impl WorkflowFormat {
    /// Pick a format from the file extension; anything but `.json` is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

/// Read, parse, and validate a workflow file.
pub fn load_workflow(path: &Path) -> Result<TaskGraph> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        StepwiseError::Workflow(format!("cannot read {}: {}", path.display(), e))
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let graph = parse_workflow(&content, WorkflowFormat::from_path(path), base_dir)?;
    debug!(path = %path.display(), steps = graph.len(), "Workflow loaded");
    Ok(graph)
}

/// Parse and validate workflow text. `prompt_file` entries resolve against `base_dir`.
pub fn parse_workflow(content: &str, format: WorkflowFormat, base_dir: &Path) -> Result<TaskGraph> {
    let file: WorkflowFile = match format {
        WorkflowFormat::Toml => {
            toml::from_str(content).map_err(|e| StepwiseError::Workflow(e.to_string()))?
        }
        WorkflowFormat::Json => {
            serde_json::from_str(content).map_err(|e| StepwiseError::Workflow(e.to_string()))?
        }
    };

    let mut steps = Vec::with_capacity(file.steps.len());
    for def in file.steps {
        let prompt = match (def.prompt, def.prompt_file) {
            (Some(prompt), None) => prompt,
            (None, Some(rel)) => {
                let path = base_dir.join(&rel);
                std::fs::read_to_string(&path).map_err(|e| {
                    StepwiseError::Workflow(format!(
                        "step {}: cannot read prompt_file {}: {}",
                        def.id,
                        path.display(),
                        e
                    ))
                })?
            }
            (Some(_), Some(_)) => {
                return Err(StepwiseError::Workflow(format!(
                    "step {}: set either prompt or prompt_file, not both",
                    def.id
                )))
            }
            (None, None) => {
                return Err(StepwiseError::Workflow(format!(
                    "step {}: missing prompt",
                    def.id
                )))
            }
        };
        steps.push(Step {
            id: def.id,
            prompt,
            depends_on: def.depends_on,
            include_dependency_output: def.include_dependency_output,
        });
    }

    TaskGraph::new(steps)
}

/// Step ids double as directory names: `[A-Za-z0-9._-]+`, never `.` or `..`.
pub fn validate_step_id(id: &str) -> Result<()> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid step id pattern"));
    if id == "." || id == ".." || !pattern.is_match(id) {
        return Err(StepwiseError::InvalidStepId(id.to_string()));
    }
    Ok(())
}

/// A validated workflow: unique ids, known dependencies, no cycles.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Validate `steps` and build the graph. All-or-nothing.
    ///
    /// Checks run in order: id syntax, duplicates, unknown dependencies, cycles.
    pub fn new(mut steps: Vec<Step>) -> Result<Self> {
        if steps.is_empty() {
            return Err(StepwiseError::Workflow("no steps".into()));
        }

        for step in &steps {
            validate_step_id(&step.id)?;
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(StepwiseError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &mut steps {
            let mut seen = HashSet::new();
            step.depends_on.retain(|d| seen.insert(d.clone()));
            for dep in &step.depends_on {
                if !index.contains_key(dep) {
                    return Err(StepwiseError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(id) = find_cycle(&steps, &index) {
            return Err(StepwiseError::CycleDetected(id));
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &steps {
            for dep in &step.depends_on {
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }

        Ok(Self {
            steps,
            index,
            dependents,
        })
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps that list `id` in `depends_on`, in declaration order.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Position of a step in declaration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// A dependency-respecting order; ties keep declaration order.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut remaining: Vec<usize> = self.steps.iter().map(|s| s.depends_on.len()).collect();
        let mut ready: VecDeque<usize> = (0..self.steps.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(i) = ready.pop_front() {
            let id = self.steps[i].id.as_str();
            order.push(id);
            for dependent in self.dependents(id) {
                let j = self.index[dependent];
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.push_back(j);
                }
            }
        }
        order
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Finished,
}

/// Depth-first search with a recursion-stack marker. Returns a step on a cycle.
fn find_cycle(steps: &[Step], index: &HashMap<String, usize>) -> Option<String> {
    let mut marks = vec![Mark::Unvisited; steps.len()];

    for root in 0..steps.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (node, next dependency to visit)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;

        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            match steps[node].depends_on.get(next) {
                Some(dep) => {
                    top.1 += 1;
                    let d = index[dep];
                    match marks[d] {
                        Mark::OnStack => return Some(steps[d].id.clone()),
                        Mark::Unvisited => {
                            marks[d] = Mark::OnStack;
                            stack.push((d, 0));
                        }
                        Mark::Finished => {}
                    }
                }
                None => {
                    marks[node] = Mark::Finished;
                    stack.pop();
                }
            }
        }
    }
    None
}
