use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KairosError, Result};
use crate::ids::{self, IdGenerator};

/// Scalar metadata value. Filters compare these for equality.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    /// Integers and floats compare numerically; everything else by variant.
    pub fn matches(&self, other: &MetaValue) -> bool {
        match (self, other) {
            (MetaValue::Int(a), MetaValue::Float(b)) | (MetaValue::Float(b), MetaValue::Int(a)) => (*a as f64) == *b,
            _ => self == other,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{}", b),
            MetaValue::Int(i) => write!(f, "{}", i),
            MetaValue::Float(x) => write!(f, "{}", x),
            MetaValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(x: f64) -> Self {
        MetaValue::Float(x)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// The unit of retrieval. Replaced as a whole on re-upsert.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Record {
    /// Time-prefixed id, kept as raw bits for the log codec.
    #[serde(rename = "id", with = "uuid_bits")]
    pub key: u128,

    #[serde(default)]
    pub metadata: Metadata,

    /// Original text the embedding was computed from
    pub content: String,

    pub embedding: Vec<f32>,
}

impl Record {
    pub fn new(id: Uuid, metadata: Metadata, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            key: id.as_u128(),
            metadata,
            content: content.into(),
            embedding,
        }
    }

    pub fn id(&self) -> Uuid {
        Uuid::from_u128(self.key)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        IdGenerator::decode_time(&self.id())
    }

    /// Write-time checks. Nothing is truncated or padded.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        let id = self.id();
        if !ids::is_time_prefixed(&id) {
            return Err(KairosError::validation(id, "id is not time-prefixed (expected version 7 layout)"));
        }
        if self.embedding.len() != dimension {
            return Err(KairosError::validation(
                id,
                format!("embedding has {} components, store dimension is {}", self.embedding.len(), dimension),
            ));
        }
        if let Some(pos) = self.embedding.iter().position(|x| !x.is_finite()) {
            return Err(KairosError::validation(id, format!("embedding component {} is not finite", pos)));
        }
        if self.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(KairosError::validation(id, "metadata keys must be non-empty"));
        }
        if let Some((k, _)) = self.metadata.iter().find(|(_, v)| matches!(v, MetaValue::Float(x) if !x.is_finite())) {
            return Err(KairosError::validation(id, format!("metadata value for '{}' is not finite", k)));
        }
        Ok(())
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id(),
            metadata: self.metadata.clone(),
            content: self.content.clone(),
            created_at: self.created_at(),
        }
    }
}

/// What a search hands to downstream consumers. The embedding stays in the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordSummary {
    pub id: Uuid,
    pub metadata: Metadata,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// One frame of the append-only record log.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum LogEntry {
    Put(Record),
    Tombstone(u128),
}

impl LogEntry {
    pub fn key(&self) -> u128 {
        match self {
            LogEntry::Put(r) => r.key,
            LogEntry::Tombstone(k) => *k,
        }
    }
}

mod uuid_bits {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(key: &u128, s: S) -> Result<S::Ok, S::Error> {
        Uuid::from_u128(*key).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        Uuid::deserialize(d).map(|id| id.as_u128())
    }
}
