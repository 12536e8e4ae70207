use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KairosError, Result};
use crate::ids::IdGenerator;
use crate::model::{MetaValue, Metadata, Record};

const MAX_PREFIX_MILLIS: i64 = 0xFFFF_FFFF_FFFF;

/// Exact-match equality over metadata keys, ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub BTreeMap<String, MetaValue>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A record missing a filtered key never matches.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0
            .iter()
            .all(|(k, want)| metadata.get(k).map_or(false, |have| have.matches(want)))
    }
}

/// Creation-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(KairosError::Parse(format!("time range ends ({}) before it starts ({})", end, start)));
        }
        Ok(Self { start, end })
    }

    // Clamped to the 48-bit id prefix so open-ended bounds stay ordered.
    fn millis(t: &DateTime<Utc>) -> u64 {
        t.timestamp_millis().clamp(0, MAX_PREFIX_MILLIS) as u64
    }

    pub fn contains_millis(&self, ms: u64) -> bool {
        Self::millis(&self.start) <= ms && ms < Self::millis(&self.end)
    }

    /// The interval as an id range `[lo, hi)` over time-prefixed ids.
    pub fn id_bounds(&self) -> (u128, u128) {
        (
            IdGenerator::lower_bound(Self::millis(&self.start)).as_u128(),
            IdGenerator::lower_bound(Self::millis(&self.end)).as_u128(),
        )
    }
}

/// Everything a search may be constrained by besides similarity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub metadata: MetadataFilter,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.time_range.is_none()
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(range) = &self.time_range {
            match IdGenerator::decode_millis(&record.id()) {
                Some(ms) if range.contains_millis(ms) => {}
                _ => return false,
            }
        }
        self.metadata.matches(&record.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn record(created: DateTime<Utc>, category: &str) -> Record {
        let mut metadata = Metadata::new();
        metadata.insert("category".into(), category.into());
        Record::new(IdGenerator::new().next_id(created), metadata, "x", vec![1.0])
    }

    #[test]
    fn metadata_filter_is_conjunctive() {
        let mut md = Metadata::new();
        md.insert("category".into(), "Shipping".into());
        md.insert("lang".into(), "en".into());

        assert!(MetadataFilter::new().with("category", "Shipping").matches(&md));
        assert!(MetadataFilter::new().with("category", "Shipping").with("lang", "en").matches(&md));
        assert!(!MetadataFilter::new().with("category", "Shipping").with("lang", "de").matches(&md));
        assert!(!MetadataFilter::new().with("missing", "x").matches(&md));
    }

    #[test]
    fn time_range_is_half_open() {
        let sept = TimeRange::new(at(2024, 9, 1), at(2024, 9, 30)).unwrap();
        let filter = SearchFilter { time_range: Some(sept), ..Default::default() };

        assert!(filter.matches(&record(at(2024, 9, 1), "a")));
        assert!(filter.matches(&record(at(2024, 9, 15), "a")));
        assert!(!filter.matches(&record(at(2024, 9, 30), "a")));
        assert!(!filter.matches(&record(at(2024, 8, 31), "a")));
    }

    #[test]
    fn id_bounds_agree_with_decoded_time() {
        let range = TimeRange::new(at(2024, 9, 1), at(2024, 10, 1)).unwrap();
        let (lo, hi) = range.id_bounds();
        for r in [record(at(2024, 9, 2), "a"), record(at(2024, 8, 2), "a"), record(at(2024, 10, 1), "a")] {
            let in_ids = lo <= r.key && r.key < hi;
            assert_eq!(in_ids, SearchFilter { time_range: Some(range), ..Default::default() }.matches(&r));
        }
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(TimeRange::new(at(2024, 9, 2), at(2024, 9, 1)).is_err());
    }
}
