//! TCP front-end.
//!
//! Request frame:  `[opcode u8][len u32 LE][JSON body]`
//! Response frame: `[status u8][len u32 LE][JSON body]`
//!
//! Errors come back with `STATUS_ERR` and a `{"kind", "message"}` body. A connection
//! carries any number of request/response pairs.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{KairosError, Result};
use crate::ingest::{Document, Ingestor};
use crate::parser::parse_filter;
use crate::query::{QueryEngine, SearchRequest};

// --- OpCodes ---
pub const OP_UPSERT: u8  = 0x01;
pub const OP_GET: u8     = 0x02;
pub const OP_SEARCH: u8  = 0x03;
pub const OP_DELETE: u8  = 0x05;
pub const OP_COMPACT: u8 = 0x08;
pub const OP_STATS: u8   = 0x09;
pub const OP_RESET: u8   = 0x0A;

pub const STATUS_OK: u8  = 0x00;
pub const STATUS_ERR: u8 = 0x01;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertBody {
    pub documents: Vec<Document>,
    /// All-or-nothing instead of per-document commits.
    #[serde(default)]
    pub atomic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdBody {
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBody {
    #[serde(flatten)]
    pub request: SearchRequest,
    /// Textual filter, merged over `request.filter`.
    #[serde(default, rename = "where")]
    pub filter_expr: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl From<&KairosError> for WireError {
    fn from(e: &KairosError) -> Self {
        Self { kind: e.kind().to_string(), message: e.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedDocument {
    pub position: usize,
    #[serde(flatten)]
    pub error: WireError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertResponse {
    pub committed: usize,
    pub rejected: Vec<RejectedDocument>,
}

/// Reads one frame. `Ok(None)` on a clean disconnect between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let length = u32::from_le_bytes(len_buf) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload too large: {} bytes (max {})", length, MAX_FRAME_BYTES),
        ));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some((tag[0], body)))
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    writer.write_all(&[tag]).await?;
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

pub struct KairosServer {
    engine: QueryEngine,
    ingestor: Arc<Ingestor>,
    search_timeout: Duration,
}

impl KairosServer {
    pub fn new(engine: QueryEngine, search_timeout: Duration) -> Result<Self> {
        let ingestor = Ingestor::new(engine.store().clone(), engine.embedder().clone())?;
        Ok(Self { engine, ingestor: Arc::new(ingestor), search_timeout })
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "listening");
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        debug!(%peer, "client connected");
                        if let Err(e) = server.handle_client(socket).await {
                            warn!(%peer, error = %e, "client error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "connection failed"),
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream) -> io::Result<()> {
        let (mut reader, writer) = stream.split();
        let mut writer = BufWriter::new(writer);

        while let Some((op_code, body)) = read_frame(&mut reader).await? {
            let (status, reply) = match self.dispatch(op_code, &body).await {
                Ok(value) => (STATUS_OK, value),
                Err(e) => {
                    debug!(op_code, error = %e, "request failed");
                    (STATUS_ERR, json!(WireError::from(&e)))
                }
            };
            let bytes = serde_json::to_vec(&reply).map_err(io::Error::from)?;
            write_frame(&mut writer, status, &bytes).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, op_code: u8, body: &[u8]) -> Result<Value> {
        match op_code {
            OP_UPSERT => self.handle_upsert(decode(body)?).await,
            OP_GET => self.handle_get(decode(body)?).await,
            OP_SEARCH => self.handle_search(decode(body)?).await,
            OP_DELETE => self.handle_delete(decode(body)?).await,
            OP_COMPACT => {
                let store = self.engine.store().clone();
                let live = blocking(move || store.compact()).await?;
                Ok(json!({ "live_records": live }))
            }
            OP_STATS => {
                let store = self.engine.store().clone();
                let stats = blocking(move || store.stats()).await?;
                Ok(json!(stats))
            }
            OP_RESET => {
                let store = self.engine.store().clone();
                blocking(move || store.reset()).await?;
                Ok(json!({ "reset": true }))
            }
            other => Err(KairosError::BadRequest(format!("unknown opcode 0x{:02X}", other))),
        }
    }

    async fn handle_upsert(&self, body: UpsertBody) -> Result<Value> {
        let ingestor = self.ingestor.clone();
        let response = if body.atomic {
            let committed = blocking(move || ingestor.ingest_atomic(body.documents)).await?;
            UpsertResponse { committed, rejected: vec![] }
        } else {
            let report = blocking(move || ingestor.ingest(body.documents)).await?;
            UpsertResponse {
                committed: report.committed,
                rejected: report
                    .rejected
                    .iter()
                    .map(|(position, e)| RejectedDocument { position: *position, error: e.into() })
                    .collect(),
            }
        };
        Ok(json!(response))
    }

    async fn handle_get(&self, body: IdBody) -> Result<Value> {
        let store = self.engine.store().clone();
        let id = body.id;
        match blocking(move || store.get(id)).await? {
            Some(record) => Ok(json!(record.summary())),
            None => Err(KairosError::NotFound(id)),
        }
    }

    async fn handle_delete(&self, body: IdBody) -> Result<Value> {
        let store = self.engine.store().clone();
        let id = body.id;
        if blocking(move || store.delete(id)).await? {
            Ok(json!({ "deleted": id }))
        } else {
            Err(KairosError::NotFound(id))
        }
    }

    async fn handle_search(&self, body: SearchBody) -> Result<Value> {
        let mut request = body.request;
        if let Some(expr) = body.filter_expr.as_deref() {
            let parsed = parse_filter(expr)?;
            request.filter.metadata.0.extend(parsed.metadata.0);
            if parsed.time_range.is_some() {
                request.filter.time_range = parsed.time_range;
            }
        }
        let timeout = body.timeout_ms.map_or(self.search_timeout, Duration::from_millis);
        let hits = self.engine.search_with_timeout(request, timeout).await?;
        Ok(json!(hits))
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| KairosError::BadRequest(e.to_string()))
}

/// Runs store work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KairosError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, OP_STATS, b"{}").await.unwrap();
        drop(a);

        let (tag, body) = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(tag, OP_STATS);
        assert_eq!(body, b"{}");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[OP_UPSERT]).await.unwrap();
        a.write_all(&(MAX_FRAME_BYTES as u32 + 1).to_le_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn search_body_accepts_a_where_clause() {
        let body: SearchBody =
            serde_json::from_str(r#"{"query":"shipping","limit":3,"where":"category = Shipping"}"#).unwrap();
        assert_eq!(body.request.query, "shipping");
        assert_eq!(body.request.limit, 3);
        assert_eq!(body.filter_expr.as_deref(), Some("category = Shipping"));
        assert!(body.timeout_ms.is_none());
    }
}
