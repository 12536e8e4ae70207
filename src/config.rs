use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KairosError, Result};
use crate::vector::Metric;

/// HNSW tuning knobs.
///
/// `ef_search` is the recall/latency trade: larger values visit more of the graph and
/// return the true nearest neighbors more often, at proportionally higher query cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    /// Max links per node on layers above 0 (layer 0 keeps `2 * m`).
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self { m: 16, ef_construction: 100, ef_search: 64 }
    }
}

/// Process-wide store settings. Built once at startup and never mutated; changing the
/// dimension means rebuilding the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_path: PathBuf,
    pub dimension: usize,
    pub metric: Metric,
    pub default_limit: usize,
    pub index: IndexParams,
    /// Filtered candidate sets at or below this size are scored exactly.
    pub exact_threshold: usize,
    /// Filters passing less than this fraction of the store are scored exactly.
    pub exact_selectivity: f32,
    /// Over-fetch factor for post-filtered graph searches.
    pub oversample: usize,
    /// fsync every log append.
    pub strict_durability: bool,
    /// Background compaction period; `None` disables the thread.
    pub compaction_interval_secs: Option<u64>,
    /// Word budget of the bundled embedding model.
    pub max_tokens: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("kairos_records.dat"),
            dimension: 384,
            metric: Metric::Cosine,
            default_limit: 5,
            index: IndexParams::default(),
            exact_threshold: 1024,
            exact_selectivity: 0.1,
            oversample: 4,
            strict_durability: true,
            compaction_interval_secs: Some(600),
            max_tokens: 256,
        }
    }
}

impl StoreConfig {
    pub fn with_path(data_path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self { data_path: data_path.into(), dimension, ..Default::default() }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: StoreConfig =
            serde_json::from_str(&raw).map_err(|e| KairosError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(KairosError::Config("dimension must be positive".into()));
        }
        if self.default_limit == 0 {
            return Err(KairosError::Config("default_limit must be positive".into()));
        }
        if self.index.m < 2 {
            return Err(KairosError::Config("index.m must be at least 2".into()));
        }
        if self.index.ef_construction == 0 || self.index.ef_search == 0 {
            return Err(KairosError::Config("index ef values must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.exact_selectivity) {
            return Err(KairosError::Config("exact_selectivity must be within [0, 1]".into()));
        }
        if self.oversample == 0 {
            return Err(KairosError::Config("oversample must be positive".into()));
        }
        if self.max_tokens == 0 {
            return Err(KairosError::Config("max_tokens must be positive".into()));
        }
        Ok(())
    }
}
