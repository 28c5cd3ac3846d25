//! Datastore tuning knobs, deserialized from the `[persistence]` and `[cache]`
//! sections of the daemon config.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl DatastoreConfig {
    /// Apply every store write before the calling operation returns.
    pub fn inline() -> Self {
        Self {
            persistence: PersistenceConfig {
                mode: PersistMode::Inline,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// How fire-and-forget writes reach the persistent store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// Queue writes for a single background task.
    #[default]
    Background,
    /// Apply writes on the caller's task.
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub mode: PersistMode,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mode: PersistMode::default(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Insert tenants read from the store on a cache miss.
    #[serde(default = "default_true")]
    pub backfill_tenants_on_miss: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backfill_tenants_on_miss: true,
        }
    }
}

fn default_queue_depth() -> usize {
    1024
}

fn default_true() -> bool {
    true
}
