pub mod config;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod ids;
pub mod index;
pub mod ingest;
pub mod manager;
pub mod model;
pub mod parser;
pub mod query;
pub mod server;
pub mod storage;
pub mod vector;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::config::{IndexParams, StoreConfig};
pub use crate::embedding::{EmbeddingProvider, HashingEmbedder};
pub use crate::error::{KairosError, Result};
pub use crate::filter::{MetadataFilter, SearchFilter, TimeRange};
pub use crate::ids::IdGenerator;
pub use crate::model::{MetaValue, Metadata, Record, RecordSummary};
pub use crate::query::{QueryEngine, SearchHit, SearchRequest};
pub use crate::vector::Metric;

use crate::index::HnswIndex;
use crate::model::LogEntry;
use crate::storage::Segment;

/// Live records plus the index derived from them. Always locked together.
pub struct StoreState {
    records: BTreeMap<u128, Arc<Record>>,
    index: HnswIndex,
}

impl StoreState {
    fn new(config: &StoreConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            index: HnswIndex::new(config.index, config.metric),
        }
    }

    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Put(record) => {
                self.index.insert(record.key, record.embedding.clone());
                self.records.insert(record.key, Arc::new(record));
            }
            LogEntry::Tombstone(key) => {
                self.index.remove(key);
                self.records.remove(&key);
            }
        }
    }
}

/// Read guard over a consistent view of the table and the index. A search holds one for
/// its whole duration, so it never sees half of a concurrent upsert.
pub struct Snapshot<'a> {
    state: RwLockReadGuard<'a, StoreState>,
}

impl<'a> Snapshot<'a> {
    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    pub fn get(&self, key: u128) -> Option<&Arc<Record>> {
        self.state.records.get(&key)
    }

    pub fn index(&self) -> &HnswIndex {
        &self.state.index
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Record>> {
        self.state.records.values()
    }

    /// Records whose id falls in `[lo, hi)`.
    pub fn range(&self, lo: u128, hi: u128) -> impl Iterator<Item = &Arc<Record>> {
        let hi = hi.max(lo);
        self.state.records.range(lo..hi).map(|(_, r)| r)
    }
}

/// Outcome of a per-record batch upsert.
#[derive(Debug, Default)]
pub struct UpsertReport {
    pub committed: usize,
    pub rejected: Vec<(Uuid, KairosError)>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub log_bytes: u64,
    pub index_layers: usize,
    pub dimension: usize,
    pub metric: Metric,
}

/// Durable record table with a synchronized similarity index.
///
/// Commits are serialized through the segment lock: the log append and the in-memory
/// apply happen under it, so same-id writers are last-committed-wins and compaction never
/// misses a frame. Validation runs before any lock is taken.
pub struct VectorStore {
    config: StoreConfig,
    segment: Mutex<Segment>,
    state: RwLock<StoreState>,
}

impl fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorStore")
            .field("path", &self.config.data_path)
            .field("dimension", &self.config.dimension)
            .field("records", &self.state.read().map(|s| s.records.len()).unwrap_or(0))
            .finish()
    }
}

impl VectorStore {
    /// Opens (creating if needed) the store and rebuilds table and index from the log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let mut segment = Segment::open(&config.data_path, config.strict_durability)?;
        let replay = segment.replay()?;

        let mut state = StoreState::new(&config);
        let frames = replay.entries.len();
        for entry in replay.entries {
            if let LogEntry::Put(record) = &entry {
                if record.embedding.len() != config.dimension {
                    return Err(KairosError::Config(format!(
                        "log holds {}-dimensional embeddings but the store is configured for {}; rebuild the store",
                        record.embedding.len(),
                        config.dimension
                    )));
                }
            }
            state.apply(entry);
        }
        info!(
            path = %config.data_path.display(),
            frames,
            records = state.records.len(),
            "record store opened"
        );

        Ok(Self {
            config,
            segment: Mutex::new(segment),
            state: RwLock::new(state),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Idempotent: recreates the log file if it disappeared, otherwise does nothing.
    pub fn create_schema(&self) -> Result<()> {
        let mut segment = self.lock_segment()?;
        if !segment.file_path.exists() {
            warn!(path = %segment.file_path.display(), "log file missing, recreating");
            let state = self.read_state()?;
            *segment = Segment::open(&self.config.data_path, self.config.strict_durability)?;
            segment.rewrite(state.records.values().map(|r| r.as_ref()))?;
        }
        Ok(())
    }

    fn lock_segment(&self) -> Result<std::sync::MutexGuard<'_, Segment>> {
        self.segment.lock().map_err(|_| KairosError::Poisoned("segment"))
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| KairosError::Poisoned("state"))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| KairosError::Poisoned("state"))
    }

    pub fn snapshot(&self) -> Result<Snapshot<'_>> {
        Ok(Snapshot { state: self.read_state()? })
    }

    fn commit(&self, entries: Vec<LogEntry>) -> Result<()> {
        let mut segment = self.lock_segment()?;
        segment.append_batch(&entries)?;
        let mut state = self.write_state()?;
        for entry in entries {
            state.apply(entry);
        }
        Ok(())
    }

    /// Per-record independent commit. Invalid records are reported and skipped; the rest
    /// of the batch still commits.
    pub fn upsert(&self, records: Vec<Record>) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        for record in records {
            let id = record.id();
            if let Err(e) = record.validate(self.config.dimension) {
                warn!(%id, error = %e, "record rejected");
                report.rejected.push((id, e));
                continue;
            }
            match self.commit(vec![LogEntry::Put(record)]) {
                Ok(()) => report.committed += 1,
                Err(e) => {
                    warn!(%id, error = %e, "record commit failed");
                    report.rejected.push((id, e));
                }
            }
        }
        debug!(committed = report.committed, rejected = report.rejected.len(), "upsert batch");
        Ok(report)
    }

    /// All-or-nothing: one invalid record rejects the whole batch. Otherwise the batch is
    /// written as one log append and applied under one index lock.
    pub fn upsert_atomic(&self, records: Vec<Record>) -> Result<usize> {
        for record in &records {
            record.validate(self.config.dimension)?;
        }
        let count = records.len();
        if count == 0 {
            return Ok(0);
        }
        self.commit(records.into_iter().map(LogEntry::Put).collect())?;
        debug!(count, "atomic upsert");
        Ok(count)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Record>> {
        let state = self.read_state()?;
        Ok(state.records.get(&id.as_u128()).map(|r| r.as_ref().clone()))
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let key = id.as_u128();
        let mut segment = self.lock_segment()?;
        if !self.read_state()?.records.contains_key(&key) {
            return Ok(false);
        }
        segment.append(&LogEntry::Tombstone(key))?;
        self.write_state()?.apply(LogEntry::Tombstone(key));
        debug!(%id, "record deleted");
        Ok(true)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_state()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bulk table reset.
    pub fn reset(&self) -> Result<()> {
        let mut segment = self.lock_segment()?;
        segment.truncate()?;
        let mut state = self.write_state()?;
        state.records.clear();
        state.index.clear();
        info!("record store reset");
        Ok(())
    }

    /// Rewrites the log down to one frame per live record.
    pub fn compact(&self) -> Result<u64> {
        let mut segment = self.lock_segment()?;
        let state = self.read_state()?;
        segment.rewrite(state.records.values().map(|r| r.as_ref()))
    }

    /// Re-derives the index entry for `id` from the table.
    pub fn resync(&self, id: Uuid) -> Result<()> {
        let key = id.as_u128();
        let mut state = self.write_state()?;
        let embedding = state.records.get(&key).map(|r| r.embedding.clone());
        match embedding {
            Some(v) => state.index.insert(key, v),
            None => {
                state.index.remove(key);
            }
        }
        warn!(%id, "index entry re-synchronized");
        Ok(())
    }

    /// Full table/index comparison. Returns the ids that had to be repaired.
    pub fn verify_index(&self) -> Result<Vec<Uuid>> {
        let stale: Vec<u128> = {
            let state = self.read_state()?;
            let mismatched = state
                .records
                .values()
                .filter(|r| state.index.vector(r.key) != Some(r.embedding.as_slice()))
                .map(|r| r.key);
            let orphaned = state.index.ids().filter(|k| !state.records.contains_key(k));
            mismatched.chain(orphaned).collect()
        };
        for key in &stale {
            self.resync(Uuid::from_u128(*key))?;
        }
        Ok(stale.into_iter().map(Uuid::from_u128).collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let log_bytes = self.lock_segment()?.len_bytes();
        let state = self.read_state()?;
        Ok(StoreStats {
            records: state.records.len(),
            log_bytes,
            index_layers: state.index.layers(),
            dimension: self.config.dimension,
            metric: self.config.metric,
        })
    }
}
