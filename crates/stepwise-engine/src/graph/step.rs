use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A unit of work in a workflow: one prompt sent to the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier, also used as the step's directory name.
    pub id: String,
    /// Opaque payload sent to the completion service.
    pub prompt: String,
    /// Steps that must be DONE before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Prefix the prompt with the recorded responses of `depends_on`.
    #[serde(default)]
    pub include_dependency_output: bool,
}

impl Step {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            depends_on: vec![],
            include_dependency_output: false,
        }
    }

    /// Add a dependency.
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    /// Set the dependencies.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_dependency_output(mut self, include: bool) -> Self {
        self.include_dependency_output = include;
        self
    }

    /// Build the payload actually sent, given `(dependency id, response)` pairs.
    pub fn build_prompt(&self, dependency_outputs: &[(String, String)]) -> String {
        if !self.include_dependency_output || dependency_outputs.is_empty() {
            return self.prompt.clone();
        }

        let mut prompt = String::from("## Context Data\n\n");
        for (id, output) in dependency_outputs {
            prompt.push_str(&format!("### {}\n\n{}\n\n", id, output.trim_end()));
        }
        prompt.push_str("---\n\n");
        prompt.push_str(&self.prompt);
        prompt
    }

    /// Hex sha256 of the declared prompt.
    pub fn prompt_hash(&self) -> String {
        format!("{:x}", Sha256::digest(self.prompt.as_bytes()))
    }
}
