use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::StateStore;
use stepwise_core::types::{
    BudgetPeriod, StepRecord, StepStatus, TranscriptArtifacts, TranscriptEntry,
};

const STEPS_DIR: &str = "steps";
const BUDGET_DIR: &str = "budget";
const TRANSCRIPT_FILE: &str = "transcript.jsonl";

/// State store laid out as plain files under a run directory.
///
/// ```text
/// steps/<id>/status        PENDING | DONE | FAILED
/// steps/<id>/record.json   full StepRecord (authoritative)
/// steps/<id>/prompt.md     recorded prompt
/// steps/<id>/response.md   recorded response or error text
/// steps/<id>/usage         measured consumption
/// budget/<period>.json     BudgetPeriod
/// transcript.jsonl         one TranscriptEntry per line
/// ```
///
/// Every file is written to a temporary sibling and renamed into place.
pub struct RunDirStore {
    root: PathBuf,
    budget_lock: Mutex<()>,
    transcript_lock: Mutex<()>,
}

impl RunDirStore {
    /// Open or create a run directory.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [root.join(STEPS_DIR), root.join(BUDGET_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StepwiseError::Store(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        debug!(path = %root.display(), "Run directory store opened");
        Ok(Self {
            root: root.to_path_buf(),
            budget_lock: Mutex::new(()),
            transcript_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn step_dir(&self, step_id: &str) -> Result<PathBuf> {
        check_component(step_id)?;
        Ok(self.root.join(STEPS_DIR).join(step_id))
    }

    fn budget_path(&self, period_key: &str) -> Result<PathBuf> {
        check_component(period_key)?;
        Ok(self.root.join(BUDGET_DIR).join(format!("{}.json", period_key)))
    }

    fn read_record(&self, step_id: &str) -> Result<Option<StepRecord>> {
        let dir = self.step_dir(step_id)?;
        let record_path = dir.join("record.json");
        match std::fs::read_to_string(&record_path) {
            Ok(json) => return Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // A bare status marker (e.g. written by hand) still counts
        match std::fs::read_to_string(dir.join("status")) {
            Ok(marker) => {
                let status = StepStatus::parse(&marker).ok_or_else(|| {
                    StepwiseError::Store(format!(
                        "Unrecognized status marker for {}: {:?}",
                        step_id,
                        marker.trim()
                    ))
                })?;
                let consumed_units = std::fs::read_to_string(dir.join("usage"))
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0);
                let mut record = StepRecord::pending(step_id);
                record.status = status;
                record.consumed_units = consumed_units;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, record: &StepRecord) -> Result<()> {
        let dir = self.step_dir(&record.step_id)?;
        std::fs::create_dir_all(&dir)?;
        write_atomic(&dir.join("status"), format!("{}\n", record.status).as_bytes())?;
        write_atomic(
            &dir.join("usage"),
            format!("{}\n", record.consumed_units).as_bytes(),
        )?;
        // record.json last: it is what readers trust
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&dir.join("record.json"), &json)
    }

    fn read_period(&self, period_key: &str) -> Result<BudgetPeriod> {
        let path = self.budget_path(period_key)?;
        match std::fs::read_to_string(&path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(BudgetPeriod::new(period_key))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn add_usage(&self, period_key: &str, delta: u64) -> Result<u64> {
        let _guard = self
            .budget_lock
            .lock()
            .map_err(|e| StepwiseError::Store(e.to_string()))?;
        let mut period = self.read_period(period_key)?;
        period.used_units = period.used_units.saturating_add(delta);
        write_atomic(
            &self.budget_path(period_key)?,
            &serde_json::to_vec_pretty(&period)?,
        )?;
        Ok(period.used_units)
    }

    fn write_transcript(&self, entry: &TranscriptEntry) -> Result<TranscriptArtifacts> {
        let dir = self.step_dir(&entry.step_id)?;
        std::fs::create_dir_all(&dir)?;

        let prompt_path = dir.join("prompt.md");
        let response_path = dir.join("response.md");
        write_atomic(&prompt_path, entry.prompt.as_bytes())?;
        let response = match &entry.error {
            Some(err) if entry.response.is_empty() => format!("ERROR: {}\n", err),
            _ => entry.response.clone(),
        };
        write_atomic(&response_path, response.as_bytes())?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let _guard = self
            .transcript_lock
            .lock()
            .map_err(|e| StepwiseError::Store(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(TRANSCRIPT_FILE))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        Ok(TranscriptArtifacts {
            prompt_path: Some(prompt_path),
            response_path: Some(response_path),
        })
    }

    fn read_response(&self, step_id: &str) -> Result<Option<String>> {
        match self.read_record(step_id)? {
            Some(record) if record.status == StepStatus::Done => {}
            _ => return Ok(None),
        }
        match std::fs::read_to_string(self.step_dir(step_id)?.join("response.md")) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_records(&self) -> Result<Vec<StepRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(self.root.join(STEPS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(step_id) = name.to_str() else {
                warn!(path = %entry.path().display(), "Skipping non-UTF-8 step directory");
                continue;
            };
            if let Some(record) = self.read_record(step_id)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(records)
    }

    fn remove_step(&self, step_id: &str) -> Result<bool> {
        let dir = self.step_dir(step_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject names that would escape their parent directory.
fn check_component(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(StepwiseError::Store(format!("Unsafe path component: {:?}", name)))
    }
}

/// Write `bytes` to `path` via a temp file in the same directory and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StepwiseError::Store(format!("No parent for {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| StepwiseError::Store(format!("Failed to persist {}: {}", path.display(), e)))?;
    Ok(())
}

impl StateStore for RunDirStore {
    fn get(&self, step_id: &str) -> BoxFuture<'_, Result<Option<StepRecord>>> {
        let step_id = step_id.to_string();
        Box::pin(async move { self.read_record(&step_id) })
    }

    fn put(&self, record: StepRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.write_record(&record) })
    }

    fn records(&self) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        Box::pin(async move { self.list_records() })
    }

    fn remove(&self, step_id: &str) -> BoxFuture<'_, Result<bool>> {
        let step_id = step_id.to_string();
        Box::pin(async move { self.remove_step(&step_id) })
    }

    fn current_period_usage(&self, period_key: &str) -> BoxFuture<'_, Result<u64>> {
        let period_key = period_key.to_string();
        Box::pin(async move { Ok(self.read_period(&period_key)?.used_units) })
    }

    fn add_period_usage(&self, period_key: &str, delta: u64) -> BoxFuture<'_, Result<u64>> {
        let period_key = period_key.to_string();
        Box::pin(async move { self.add_usage(&period_key, delta) })
    }

    fn record_transcript(
        &self,
        entry: &TranscriptEntry,
    ) -> BoxFuture<'_, Result<TranscriptArtifacts>> {
        let entry = entry.clone();
        Box::pin(async move { self.write_transcript(&entry) })
    }

    fn response(&self, step_id: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let step_id = step_id.to_string();
        Box::pin(async move { self.read_response(&step_id) })
    }
}
