use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, KairosError>;

#[derive(Debug, Error)]
pub enum KairosError {
    /// Record rejected at write time. Reported per record.
    #[error("invalid record {id}: {reason}")]
    Validation { id: Uuid, reason: String },

    /// Provider unavailable or input over budget. There is never a fallback vector.
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("record {0} not found")]
    NotFound(Uuid),

    /// Index and table disagree about a record. Should never reach callers.
    #[error("similarity index out of sync for {0}")]
    IndexInconsistency(Uuid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log frame at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filter expressions, timestamps and time ranges.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("csv import failed: {0}")]
    Csv(String),

    /// Malformed wire request body or opcode.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("poisoned lock: {0}")]
    Poisoned(&'static str),
}

impl KairosError {
    pub fn validation(id: Uuid, reason: impl Into<String>) -> Self {
        KairosError::Validation { id, reason: reason.into() }
    }

    /// Wire-level classification used by the server responses.
    pub fn kind(&self) -> &'static str {
        match self {
            KairosError::Validation { .. } => "validation",
            KairosError::Embedding(_) => "embedding",
            KairosError::Timeout { .. } => "timeout",
            KairosError::NotFound(_) => "not_found",
            KairosError::IndexInconsistency(_) => "index_inconsistency",
            KairosError::Io(_) => "io",
            KairosError::Corrupt { .. } => "corrupt",
            KairosError::Config(_) => "config",
            KairosError::Parse(_) => "parse",
            KairosError::Csv(_) => "csv",
            KairosError::BadRequest(_) => "bad_request",
            KairosError::Poisoned(_) => "poisoned",
        }
    }
}
