use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::embedding::{embed_checked, EmbeddingProvider};
use crate::error::{KairosError, Result};
use crate::ids::IdGenerator;
use crate::model::{MetaValue, Metadata, Record};
use crate::VectorStore;

/// Text waiting to be embedded and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time encoded into a fresh id. Defaults to now.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Re-upsert target. Takes precedence over `created_at`.
    #[serde(default)]
    pub id: Option<Uuid>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into(), metadata: Metadata::new(), created_at: None, id: None }
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub committed: usize,
    /// Input position and reason of every document that did not make it in.
    pub rejected: Vec<(usize, KairosError)>,
}

/// Embeds documents, assigns ids and commits them to a store.
pub struct Ingestor {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    ids: IdGenerator,
}

impl Ingestor {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if embedder.dimension() != store.dimension() {
            return Err(KairosError::Config(format!(
                "model '{}' produces {} dimensions, store expects {}",
                embedder.model_id(),
                embedder.dimension(),
                store.dimension()
            )));
        }
        Ok(Self { store, embedder, ids: IdGenerator::new() })
    }

    pub fn prepare(&self, doc: Document) -> Result<Record> {
        let embedding = embed_checked(self.embedder.as_ref(), &doc.content)?;
        let id = match doc.id {
            Some(id) => id,
            None => self.ids.next_id(doc.created_at.unwrap_or_else(Utc::now)),
        };
        Ok(Record::new(id, doc.metadata, doc.content, embedding))
    }

    /// Embeds in parallel; output order matches input order.
    pub fn prepare_batch(&self, docs: Vec<Document>) -> Vec<Result<Record>> {
        docs.into_par_iter().map(|doc| self.prepare(doc)).collect()
    }

    /// Independent commit per document: failures are reported, the rest lands.
    pub fn ingest(&self, docs: Vec<Document>) -> Result<IngestReport> {
        let total = docs.len();
        let mut report = IngestReport::default();

        for (pos, prepared) in self.prepare_batch(docs).into_iter().enumerate() {
            let record = match prepared {
                Ok(record) => record,
                Err(e) => {
                    warn!(position = pos, error = %e, "document not embedded");
                    report.rejected.push((pos, e));
                    continue;
                }
            };
            let upserted = self.store.upsert(vec![record])?;
            report.committed += upserted.committed;
            report.rejected.extend(upserted.rejected.into_iter().map(|(_, e)| (pos, e)));
        }

        info!(total, committed = report.committed, rejected = report.rejected.len(), "ingest finished");
        Ok(report)
    }

    /// All-or-nothing: the first embedding or validation failure aborts the batch.
    pub fn ingest_atomic(&self, docs: Vec<Document>) -> Result<usize> {
        let records = self.prepare_batch(docs).into_iter().collect::<Result<Vec<_>>>()?;
        self.store.upsert_atomic(records)
    }
}

/// Reads a `;`-separated FAQ export with `question`, `answer` and `category` columns.
///
/// Each row becomes `Question: <q>\nAnswer: <a>` with `category` and an ISO-8601
/// `created_at` in its metadata. Quoted fields may span lines.
pub fn load_faq_csv(path: &Path, created_at: DateTime<Utc>) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path)?;
    parse_faq_csv(&raw, created_at).map_err(|e| match e {
        KairosError::Csv(msg) => KairosError::Csv(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

pub fn parse_faq_csv(raw: &str, created_at: DateTime<Utc>) -> Result<Vec<Document>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let header: Vec<String> = reader.headers().map_err(csv_error)?.iter().map(|h| h.to_lowercase()).collect();
    if header.iter().all(|h| h.is_empty()) {
        return Err(KairosError::Csv("empty file".into()));
    }
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| KairosError::Csv(format!("missing '{}' column", name)))
    };
    let (q_col, a_col, c_col) = (column("question")?, column("answer")?, column("category")?);

    let mut docs = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        let line = row.position().map_or(0, |p| p.line());
        let field = |col: usize| {
            row.get(col).ok_or_else(|| {
                KairosError::Csv(format!("line {}: expected {} fields, found {}", line, header.len(), row.len()))
            })
        };
        let content = format!("Question: {}\nAnswer: {}", field(q_col)?, field(a_col)?);
        docs.push(
            Document::new(content)
                .meta("category", field(c_col)?)
                .meta("created_at", created_at.to_rfc3339())
                .created_at(created_at),
        );
    }
    Ok(docs)
}

fn csv_error(e: csv::Error) -> KairosError {
    match e.position() {
        Some(pos) => KairosError::Csv(format!("line {}: {}", pos.line(), e)),
        None => KairosError::Csv(e.to_string()),
    }
}
