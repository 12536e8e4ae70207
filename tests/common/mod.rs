#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use kairos::{EmbeddingProvider, IdGenerator, KairosError, Metadata, QueryEngine, Record, Result, StoreConfig, VectorStore};

pub const DIM: usize = 4;

/// One axis per topic, summed and normalized. Every other word adds a little to the last
/// axis, so off-topic text still gets a vector.
pub struct TopicEmbedder;

impl EmbeddingProvider for TopicEmbedder {
    fn model_id(&self) -> &str {
        "topic-stub"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn max_tokens(&self) -> usize {
        64
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_lowercase();
        if text.trim().is_empty() {
            return Err(KairosError::Embedding("empty input".into()));
        }
        let mut v = vec![0.0f32; DIM];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let (axis, weight) = if word.starts_with("ship") || word == "delivery" {
                (0, 1.0)
            } else if word.starts_with("return") || word == "refund" {
                (1, 1.0)
            } else if word.starts_with("pay") || word == "card" {
                (2, 1.0)
            } else {
                (3, 0.1)
            };
            v[axis] += weight;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        Ok(v.into_iter().map(|x| x / norm).collect())
    }
}

pub fn config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig::with_path(dir.join("records.dat"), DIM);
    config.strict_durability = false;
    config.compaction_interval_secs = None;
    config
}

pub fn open(dir: &Path) -> Arc<VectorStore> {
    Arc::new(VectorStore::open(config(dir)).unwrap())
}

pub fn engine(store: &Arc<VectorStore>) -> QueryEngine {
    QueryEngine::new(store.clone(), Arc::new(TopicEmbedder)).unwrap()
}

pub fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs.iter().map(|(k, v)| (k.to_string(), (*v).into())).collect()
}

pub fn embed(text: &str) -> Vec<f32> {
    TopicEmbedder.embed(text).unwrap()
}

pub fn record(ids: &IdGenerator, at: DateTime<Utc>, pairs: &[(&str, &str)], content: &str) -> Record {
    Record::new(ids.next_id(at), meta(pairs), content, embed(content))
}
