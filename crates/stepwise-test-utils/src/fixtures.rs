use std::path::{Path, PathBuf};

use stepwise_core::config::AppConfig;

/// a -> b -> c
pub const CHAIN_WORKFLOW: &str = r#"
[[steps]]
id = "a"
prompt = "Step A: collect the inputs"

[[steps]]
id = "b"
prompt = "Step B: summarize the inputs"
depends_on = ["a"]

[[steps]]
id = "c"
prompt = "Step C: write the report"
depends_on = ["b"]
"#;

/// a -> {b, c} -> d
pub const DIAMOND_WORKFLOW: &str = r#"
[[steps]]
id = "a"
prompt = "Step A: root"

[[steps]]
id = "b"
prompt = "Step B: left branch"
depends_on = ["a"]

[[steps]]
id = "c"
prompt = "Step C: right branch"
depends_on = ["a"]

[[steps]]
id = "d"
prompt = "Step D: join"
depends_on = ["b", "c"]
"#;

/// Three steps with no dependencies.
pub const INDEPENDENT_WORKFLOW: &str = r#"
[[steps]]
id = "x"
prompt = "Step X"

[[steps]]
id = "y"
prompt = "Step Y"

[[steps]]
id = "z"
prompt = "Step Z"
"#;

/// Write a workflow file into `dir` and return its path.
pub fn write_workflow(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write workflow fixture");
    path
}

/// Defaults with the run directory pointed at `run_dir` and notification
/// logging off.
pub fn test_config(run_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.run.run_dir = run_dir.display().to_string();
    config.notify.log = false;
    config
}

/// A fresh temporary directory for one run.
pub fn temp_run_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp run dir")
}
