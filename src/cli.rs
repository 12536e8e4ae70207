use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use kairos::ingest::load_faq_csv;
use kairos::parser::parse_time;
use kairos::server::{
    IdBody, SearchBody, UpsertBody, UpsertResponse, WireError, OP_COMPACT, OP_DELETE, OP_GET, OP_RESET, OP_SEARCH,
    OP_STATS, OP_UPSERT, STATUS_OK,
};
use kairos::{RecordSummary, SearchHit, SearchRequest};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Client for a running kairos server", long_about = None)]
struct Cli {
    #[clap(long, env = "KAIROS_ADDR", default_value = "127.0.0.1:9000")]
    host: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a `;`-separated FAQ export (question;answer;category).
    Ingest {
        csv: PathBuf,
        /// Creation time stamped on every row (YYYY-MM-DD or RFC 3339). Defaults to now.
        #[clap(long)]
        created_at: Option<String>,
        #[clap(long, default_value = "256")]
        batch: usize,
        /// Reject a whole batch if any row fails.
        #[clap(long)]
        atomic: bool,
    },
    Search {
        text: String,
        /// e.g. "category = 'Shipping' AND created >= 2024-09-01"
        #[clap(long = "where")]
        filter: Option<String>,
        #[clap(long, default_value = "0")]
        limit: usize,
        #[clap(long)]
        min_score: Option<f32>,
        #[clap(long)]
        timeout_ms: Option<u64>,
    },
    Get {
        id: Uuid,
    },
    Delete {
        id: Uuid,
    },
    Compact,
    Stats,
    /// Drops every record.
    Reset {
        #[clap(long)]
        yes: bool,
    },
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(host: &str) -> Result<Self, String> {
        let stream = TcpStream::connect(host)
            .map_err(|e| format!("could not connect to {} ({}); is the kairos server running?", host, e))?;
        Ok(Self { stream })
    }

    fn call<B: Serialize>(&mut self, op_code: u8, body: &B) -> Result<Value, String> {
        let payload = serde_json::to_vec(body).map_err(|e| e.to_string())?;
        let io = |e: std::io::Error| format!("connection error: {}", e);

        self.stream.write_all(&[op_code]).map_err(io)?;
        self.stream.write_all(&(payload.len() as u32).to_le_bytes()).map_err(io)?;
        self.stream.write_all(&payload).map_err(io)?;

        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status).map_err(io)?;
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(io)?;
        let mut reply = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        self.stream.read_exact(&mut reply).map_err(io)?;

        if status[0] == STATUS_OK {
            serde_json::from_slice(&reply).map_err(|e| format!("bad response: {}", e))
        } else {
            let err: WireError = serde_json::from_slice(&reply).map_err(|e| format!("bad error response: {}", e))?;
            Err(format!("[{}] {}", err.kind, err.message))
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("[\u{2717}] {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let mut client = Client::connect(&cli.host)?;
    match cli.command {
        Command::Ingest { csv, created_at, batch, atomic } => perform_ingest(&mut client, csv, created_at, batch, atomic),
        Command::Search { text, filter, limit, min_score, timeout_ms } => {
            let mut request = SearchRequest::new(text).limit(limit);
            request.min_score = min_score;
            perform_search(&mut client, SearchBody { request, filter_expr: filter, timeout_ms })
        }
        Command::Get { id } => {
            let value = client.call(OP_GET, &IdBody { id })?;
            let record: RecordSummary = serde_json::from_value(value).map_err(|e| e.to_string())?;
            print_record(&record);
            Ok(())
        }
        Command::Delete { id } => {
            client.call(OP_DELETE, &IdBody { id })?;
            println!("[\u{2713}] deleted {}", id);
            Ok(())
        }
        Command::Compact => {
            let value = client.call(OP_COMPACT, &json!({}))?;
            println!("[\u{2713}] compacted, {} live records", value["live_records"]);
            Ok(())
        }
        Command::Stats => {
            let value = client.call(OP_STATS, &json!({}))?;
            println!("{}", serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?);
            Ok(())
        }
        Command::Reset { yes } => {
            if !yes {
                return Err("reset drops every record; pass --yes to confirm".into());
            }
            client.call(OP_RESET, &json!({}))?;
            println!("[\u{2713}] store reset");
            Ok(())
        }
    }
}

fn perform_ingest(client: &mut Client, csv: PathBuf, created_at: Option<String>, batch: usize, atomic: bool) -> Result<(), String> {
    let created_at = match created_at {
        Some(raw) => parse_time(&raw).map_err(|e| e.to_string())?,
        None => Utc::now(),
    };
    let docs = load_faq_csv(&csv, created_at).map_err(|e| e.to_string())?;
    let total = docs.len();

    let mut committed = 0;
    let mut rejected = 0;
    for (n, chunk) in docs.chunks(batch.max(1)).enumerate() {
        let offset = n * batch.max(1);
        let value = client.call(OP_UPSERT, &UpsertBody { documents: chunk.to_vec(), atomic })?;
        let response: UpsertResponse = serde_json::from_value(value).map_err(|e| e.to_string())?;
        committed += response.committed;
        for r in &response.rejected {
            rejected += 1;
            println!("  document {}: [{}] {}", offset + r.position + 1, r.error.kind, r.error.message);
        }
    }
    println!("[\u{2713}] {} of {} documents stored ({} rejected) from {}", committed, total, rejected, csv.display());
    Ok(())
}

fn perform_search(client: &mut Client, body: SearchBody) -> Result<(), String> {
    let value = client.call(OP_SEARCH, &body)?;
    let hits: Vec<SearchHit> = serde_json::from_value(value).map_err(|e| e.to_string())?;

    println!("\nFound {} matches:", hits.len());
    for hit in &hits {
        let created = hit.record.created_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
        println!("  \u{2022} {} (score: {:.4}, created: {})", hit.record.id, hit.score, created);
        for line in hit.record.content.lines() {
            println!("      {}", line);
        }
    }
    println!();
    Ok(())
}

fn print_record(record: &RecordSummary) {
    println!("id:       {}", record.id);
    if let Some(t) = record.created_at {
        println!("created:  {}", t.to_rfc3339());
    }
    for (k, v) in &record.metadata {
        println!("{:<9} {}", format!("{}:", k), v);
    }
    println!("\n{}", record.content);
}
