mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kairos::ingest::Document;
use kairos::server::*;
use kairos::{RecordSummary, SearchHit};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};

async fn start(dir: &std::path::Path) -> String {
    let store = open(dir);
    let server = Arc::new(KairosServer::new(engine(&store), Duration::from_secs(5)).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.serve(listener));
    addr
}

async fn call(stream: &mut TcpStream, op: u8, body: &Value) -> (u8, Value) {
    write_frame(stream, op, &serde_json::to_vec(body).unwrap()).await.unwrap();
    let (status, reply) = read_frame(stream).await.unwrap().unwrap();
    (status, serde_json::from_slice(&reply).unwrap())
}

#[tokio::test]
async fn round_trip_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start(dir.path()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let docs = vec![
        Document::new("Question: What are the shipping options?\nAnswer: Standard delivery.")
            .meta("category", "Shipping")
            .created_at(day(2024, 9, 5)),
        Document::new("Question: How do I return an item?\nAnswer: Within 30 days.")
            .meta("category", "Returns")
            .created_at(day(2024, 9, 6)),
        Document::new("   ").meta("category", "Empty"),
    ];
    let (status, reply) = call(&mut stream, OP_UPSERT, &json!({ "documents": docs })).await;
    assert_eq!(status, STATUS_OK);
    let upserted: UpsertResponse = serde_json::from_value(reply).unwrap();
    assert_eq!(upserted.committed, 2);
    assert_eq!(upserted.rejected.len(), 1);
    assert_eq!(upserted.rejected[0].position, 2);
    assert_eq!(upserted.rejected[0].error.kind, "embedding");

    let search = json!({
        "query": "shipping",
        "limit": 5,
        "where": "category = 'Shipping' AND created >= 2024-09-01 AND created < 2024-09-30"
    });
    let (status, reply) = call(&mut stream, OP_SEARCH, &search).await;
    assert_eq!(status, STATUS_OK);
    let hits: Vec<SearchHit> = serde_json::from_value(reply).unwrap();
    assert_eq!(hits.len(), 1);
    let id = hits[0].record.id;

    let (status, reply) = call(&mut stream, OP_GET, &json!({ "id": id })).await;
    assert_eq!(status, STATUS_OK);
    let record: RecordSummary = serde_json::from_value(reply).unwrap();
    assert!(record.content.contains("shipping options"));

    let (status, _) = call(&mut stream, OP_DELETE, &json!({ "id": id })).await;
    assert_eq!(status, STATUS_OK);
    let (status, reply) = call(&mut stream, OP_GET, &json!({ "id": id })).await;
    assert_eq!(status, STATUS_ERR);
    assert_eq!(reply["kind"], "not_found");

    let (status, reply) = call(&mut stream, OP_STATS, &json!({})).await;
    assert_eq!(status, STATUS_OK);
    assert_eq!(reply["records"], 1);
    assert_eq!(reply["dimension"], DIM);

    let (status, reply) = call(&mut stream, OP_COMPACT, &json!({})).await;
    assert_eq!(status, STATUS_OK);
    assert_eq!(reply["live_records"], 1);

    let (status, _) = call(&mut stream, OP_RESET, &json!({})).await;
    assert_eq!(status, STATUS_OK);
    let (_, reply) = call(&mut stream, OP_STATS, &json!({})).await;
    assert_eq!(reply["records"], 0);
}

#[tokio::test]
async fn errors_keep_the_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start(dir.path()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let (status, reply) = call(&mut stream, 0x7F, &json!({})).await;
    assert_eq!(status, STATUS_ERR);
    assert_eq!(reply["kind"], "bad_request");

    let (status, reply) = call(&mut stream, OP_GET, &json!({ "id": "not-a-uuid" })).await;
    assert_eq!(status, STATUS_ERR);
    assert_eq!(reply["kind"], "bad_request");

    let (status, reply) = call(&mut stream, OP_SEARCH, &json!({ "query": "x", "where": "category >= 3" })).await;
    assert_eq!(status, STATUS_ERR);
    assert_eq!(reply["kind"], "parse");

    let (status, _) = call(&mut stream, OP_STATS, &json!({})).await;
    assert_eq!(status, STATUS_OK);
}

#[tokio::test]
async fn atomic_upsert_rejects_the_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start(dir.path()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let docs = vec![Document::new("shipping"), Document::new("")];
    let (status, reply) = call(&mut stream, OP_UPSERT, &json!({ "documents": docs, "atomic": true })).await;
    assert_eq!(status, STATUS_ERR);
    assert_eq!(reply["kind"], "embedding");

    let (_, reply) = call(&mut stream, OP_STATS, &json!({})).await;
    assert_eq!(reply["records"], 0);
}
