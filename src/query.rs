//! Filtered similarity search.
//!
//! A search embeds the query text, narrows the candidate set by metadata equality and
//! creation-time range, then ranks by distance. Two execution paths produce the same
//! ordering:
//!
//! * **exact**: score every candidate. Used when the filtered set is small or selective.
//! * **graph**: HNSW search over-fetching `limit * oversample`, then drop ids outside the
//!   filter. If that leaves fewer than `limit` hits it falls back to the exact path.
//!
//! The graph path is approximate (see [`crate::index`]); the exact path is the reference.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::{embed_checked, EmbeddingProvider};
use crate::error::{KairosError, Result};
use crate::filter::{MetadataFilter, SearchFilter, TimeRange};
use crate::model::{MetaValue, Record, RecordSummary};
use crate::{Snapshot, VectorStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// `0` means the store's configured default.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub filter: SearchFilter,
    /// Hits scoring below this are dropped.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Default::default() }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        let current = std::mem::take(&mut self.filter.metadata);
        self.filter.metadata = current.with(key, value);
        self
    }

    pub fn metadata_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter.metadata = filter;
        self
    }

    pub fn time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        self.filter.time_range = Some(TimeRange::new(start, end)?);
        Ok(self)
    }

    pub fn filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn min_score(mut self, score: f32) -> Self {
        self.min_score = Some(score);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: RecordSummary,
    pub distance: f32,
    /// Higher is more similar.
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Exact,
    Graph,
}

/// Search front-end over a store and the model that embedded its records.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl QueryEngine {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if embedder.dimension() != store.dimension() {
            return Err(KairosError::Config(format!(
                "model '{}' produces {} dimensions, store expects {}",
                embedder.model_id(),
                embedder.dimension(),
                store.dimension()
            )));
        }
        Ok(Self { store, embedder })
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let vector = embed_checked(self.embedder.as_ref(), &request.query)?;
        self.search_vector(&vector, request)
    }

    /// Runs [`search`](Self::search) on the blocking pool and gives up after `timeout`.
    /// Nothing is retried.
    pub async fn search_with_timeout(&self, request: SearchRequest, timeout: Duration) -> Result<Vec<SearchHit>> {
        let engine = self.clone();
        let task = tokio::task::spawn_blocking(move || engine.search(&request));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => Err(KairosError::Embedding(format!("search task failed: {}", e))),
            Err(_) => Err(KairosError::Timeout { operation: "search", after: timeout }),
        }
    }

    /// Search with a caller-supplied query vector. `request.query` is ignored.
    pub fn search_vector(&self, vector: &[f32], request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let config = self.store.config();
        if vector.len() != config.dimension {
            return Err(KairosError::validation(
                Uuid::nil(),
                format!("query vector has {} components, store dimension is {}", vector.len(), config.dimension),
            ));
        }
        let limit = if request.limit == 0 { config.default_limit } else { request.limit };
        let started = Instant::now();

        let (hits, stale, plan) = {
            let snap = self.store.snapshot()?;
            let (ranked, stale, plan) = self.rank(&snap, vector, limit, &request.filter);

            let metric = config.metric;
            let hits: Vec<SearchHit> = ranked
                .into_iter()
                .filter_map(|(key, distance)| {
                    let record = snap.get(key)?;
                    Some(SearchHit { record: record.summary(), distance, score: metric.score(distance) })
                })
                .filter(|hit| request.min_score.map_or(true, |min| hit.score >= min))
                .take(limit)
                .collect();
            (hits, stale, plan)
        };

        for key in stale {
            let id = Uuid::from_u128(key);
            warn!(error = %KairosError::IndexInconsistency(id), "stale index entry skipped");
            self.store.resync(id)?;
        }

        debug!(
            plan = ?plan,
            limit,
            hits = hits.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "search complete"
        );
        Ok(hits)
    }

    /// Returns `(id, distance)` nearest first, plus ids found out of sync.
    fn rank(&self, snap: &Snapshot<'_>, vector: &[f32], limit: usize, filter: &SearchFilter) -> (Vec<(u128, f32)>, Vec<u128>, Plan) {
        let config = self.store.config();
        let total = snap.len();

        let candidates: Option<Vec<u128>> = if filter.is_empty() {
            None
        } else {
            let scope: Box<dyn Iterator<Item = &Arc<Record>> + '_> = match &filter.time_range {
                Some(range) => {
                    let (lo, hi) = range.id_bounds();
                    Box::new(snap.range(lo, hi))
                }
                None => Box::new(snap.iter()),
            };
            Some(scope.filter(|r| filter.matches(r)).map(|r| r.key).collect())
        };

        let selected = candidates.as_ref().map_or(total, |c| c.len());
        if selected == 0 {
            return (vec![], vec![], Plan::Exact);
        }
        let limit = limit.min(selected);

        let selective = (selected as f32) <= config.exact_selectivity * total as f32;
        let plan = if selected <= config.exact_threshold || (candidates.is_some() && selective) {
            Plan::Exact
        } else {
            Plan::Graph
        };

        let index = snap.index();
        let mut stale = Vec::new();

        if plan == Plan::Graph {
            let fetch = match &candidates {
                Some(_) => limit.saturating_mul(config.oversample).min(total),
                None => limit,
            };
            let allowed: Option<HashSet<u128>> = candidates.as_ref().map(|c| c.iter().copied().collect());
            let ef = config.index.ef_search.max(fetch);

            let mut ranked = Vec::with_capacity(limit);
            for (key, dist) in index.search(vector, fetch, ef) {
                if snap.get(key).is_none() {
                    stale.push(key);
                    continue;
                }
                if allowed.as_ref().map_or(true, |a| a.contains(&key)) {
                    ranked.push((key, dist));
                    if ranked.len() == limit {
                        break;
                    }
                }
            }
            if ranked.len() >= limit {
                return (ranked, stale, Plan::Graph);
            }
            debug!(found = ranked.len(), limit, "graph search short, falling back to exact scan");
        }

        let keys: Vec<u128> = match candidates {
            Some(c) => c,
            None => snap.iter().map(|r| r.key).collect(),
        };
        stale.extend(keys.iter().copied().filter(|k| !index.contains(*k)));
        (index.search_exact(vector, limit, keys), stale, Plan::Exact)
    }
}
