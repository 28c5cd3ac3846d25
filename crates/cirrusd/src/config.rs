//! Daemon configuration and workload seeding.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cirrus_datastore::{CacheConfig, DatastoreConfig, PersistenceConfig};
use cirrus_state::{PersistentStore, Workload};

/// Top-level `cirrusd.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    /// TOML file of `[[workload]]` tables loaded at startup.
    pub workloads_path: Option<PathBuf>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn datastore(&self) -> DatastoreConfig {
        DatastoreConfig {
            persistence: self.persistence.clone(),
            cache: self.cache.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkloadFile {
    #[serde(default)]
    workload: Vec<Workload>,
}

/// Store every workload in `path` that the store doesn't know yet.
/// Returns how many were inserted.
pub fn seed_workloads(store: &dyn PersistentStore, path: &Path) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let file: WorkloadFile = toml::from_str(&content)?;

    let mut inserted = 0;
    for workload in &file.workload {
        if store.get_workload(&workload.id)?.is_some() {
            debug!(workload_id = %workload.id, "workload already stored");
            continue;
        }
        store.put_workload(workload)?;
        inserted += 1;
    }
    info!(?path, inserted, total = file.workload.len(), "workloads seeded");
    Ok(inserted)
}
