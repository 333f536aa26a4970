pub mod run_dir;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use stepwise_core::config::{AppConfig, StoreBackend};
use stepwise_core::error::Result;
use stepwise_core::traits::StateStore;

pub use run_dir::RunDirStore;
pub use sqlite::SqliteStore;

/// Open the configured state store for a run directory.
///
/// The run directory is always created, even with the sqlite backend, since
/// the run log and notification log live there.
pub fn open_store(config: &AppConfig, run_dir: &Path) -> Result<Arc<dyn StateStore>> {
    match config.store.backend {
        StoreBackend::RunDir => Ok(Arc::new(RunDirStore::open(run_dir)?)),
        StoreBackend::Sqlite => {
            std::fs::create_dir_all(run_dir)?;
            let path = match &config.store.sqlite_path {
                Some(_) => config.sqlite_path(),
                None => run_dir.join("state.db"),
            };
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
    }
}
