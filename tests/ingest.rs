mod common;

use std::sync::Arc;

use common::*;
use kairos::ingest::{load_faq_csv, Document, Ingestor};
use kairos::{IdGenerator, KairosError, MetaValue, SearchRequest};

const FAQ: &str = "question;answer;category
What are your shipping options?;Standard and express delivery;Shipping
How do I return an item?;\"Send it back; we refund within 30 days\";Returns
Which payment methods do you accept?;Card and invoice;Payments
";

#[test]
fn faq_export_is_searchable_after_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("faq.csv");
    std::fs::write(&csv, FAQ).unwrap();

    let store = open(dir.path());
    let ingestor = Ingestor::new(store.clone(), Arc::new(TopicEmbedder)).unwrap();
    let docs = load_faq_csv(&csv, day(2024, 9, 10)).unwrap();
    let report = ingestor.ingest(docs).unwrap();
    assert_eq!(report.committed, 3);
    assert!(report.rejected.is_empty());

    let request = SearchRequest::new("How can I get a refund?")
        .limit(1)
        .time_range(day(2024, 9, 1), day(2024, 9, 30))
        .unwrap();
    let hits = engine(&store).search(&request).unwrap();
    assert_eq!(hits[0].record.metadata["category"], MetaValue::from("Returns"));
    assert!(hits[0].record.content.starts_with("Question: How do I return an item?\nAnswer: Send it back; we refund"));
    assert_eq!(
        IdGenerator::decode_time(&hits[0].record.id).map(|t| t.date_naive()),
        Some(day(2024, 9, 10).date_naive())
    );
}

#[test]
fn rejected_documents_report_their_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let ingestor = Ingestor::new(store.clone(), Arc::new(TopicEmbedder)).unwrap();

    let report = ingestor
        .ingest(vec![Document::new("shipping"), Document::new(""), Document::new("returns")])
        .unwrap();
    assert_eq!(report.committed, 2);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, 1);
    assert!(matches!(report.rejected[0].1, KairosError::Embedding(_)));
}

#[test]
fn explicit_ids_replace_existing_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let ingestor = Ingestor::new(store.clone(), Arc::new(TopicEmbedder)).unwrap();

    let first = ingestor.prepare(Document::new("shipping").created_at(day(2024, 9, 1))).unwrap();
    store.upsert(vec![first.clone()]).unwrap();

    let n = ingestor
        .ingest_atomic(vec![Document::new("shipping abroad").meta("lang", "en").with_id(first.id())])
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(store.len().unwrap(), 1);
    let stored = store.get(first.id()).unwrap().unwrap();
    assert_eq!(stored.content, "shipping abroad");
    assert_eq!(stored.metadata["lang"], MetaValue::from("en"));
}

#[test]
fn store_rejections_keep_the_document_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let ingestor = Ingestor::new(store.clone(), Arc::new(TopicEmbedder)).unwrap();

    let random_id = uuid::Uuid::new_v4();
    let report = ingestor
        .ingest(vec![
            Document::new("shipping"),
            Document::new("returns"),
            Document::new("payments").with_id(random_id),
            Document::new("delivery"),
        ])
        .unwrap();
    assert_eq!(report.committed, 3);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, 2);
    assert!(matches!(&report.rejected[0].1, KairosError::Validation { id, .. } if *id == random_id));
}

#[test]
fn multi_line_answers_survive_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("faq.csv");
    std::fs::write(&csv, "question;answer;category\nDo you ship abroad?;\"Yes.\nDelivery takes 5-10 days.\";Shipping\n").unwrap();

    let store = open(dir.path());
    let ingestor = Ingestor::new(store.clone(), Arc::new(TopicEmbedder)).unwrap();
    let report = ingestor.ingest(load_faq_csv(&csv, day(2024, 9, 10)).unwrap()).unwrap();
    assert_eq!(report.committed, 1);

    let hits = engine(&store).search(&SearchRequest::new("shipping").limit(1)).unwrap();
    assert_eq!(hits[0].record.content, "Question: Do you ship abroad?\nAnswer: Yes.\nDelivery takes 5-10 days.");
}
