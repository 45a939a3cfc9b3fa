//! Handling of S3 notifications as delivered to the function.

mod common;

use aws_lambda_events::event::s3::S3Event;
use bytes::Bytes;
use common::{ScriptedClassifier, Step, BUCKET};
use image_label_bridge::app::{App, OutcomeSummary};
use image_label_bridge::classify::Label;
use image_label_bridge::conf::Settings;
use image_label_bridge::deadletter::InMemoryDeadLetterSink;
use image_label_bridge::ledger::{InMemoryLedger, ResultLedger};
use image_label_bridge::observability::TraceContext;
use image_label_bridge::store::{InMemoryStore, ObjectStore};
use serde_json::{json, Value};
use std::sync::Arc;

fn record(event_name: &str, key: &str, version: &str) -> Value {
    json!({
        "eventVersion": "2.1",
        "eventSource": "aws:s3",
        "awsRegion": "us-east-1",
        "eventTime": "2024-02-26T08:39:36.000Z",
        "eventName": event_name,
        "userIdentity": { "principalId": "EXAMPLE" },
        "requestParameters": { "sourceIPAddress": "127.0.0.1" },
        "responseElements": {
            "x-amz-request-id": "EXAMPLE123456789",
            "x-amz-id-2": "EXAMPLE123/5678abcdefghijklambdaisawesome/mnopqrstuvwxyzABCDEFGH"
        },
        "s3": {
            "s3SchemaVersion": "1.0",
            "configurationId": "testConfigRule",
            "bucket": {
                "name": BUCKET,
                "ownerIdentity": { "principalId": "EXAMPLE" },
                "arn": "arn:aws:s3:::images"
            },
            "object": {
                "key": key,
                "size": 1024,
                "eTag": "0123456789abcdef0123456789abcdef",
                "versionId": version,
                "sequencer": "0A1B2C3D4E5F678901"
            }
        }
    })
}

fn settings(vars: &[(&str, &str)]) -> Settings {
    envy::from_iter(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>(),
    )
    .unwrap()
}

async fn app(vars: &[(&str, &str)]) -> (App, Arc<InMemoryStore>, Arc<ScriptedClassifier>) {
    let store = Arc::new(InMemoryStore::new());
    let classifier = ScriptedClassifier::always(vec![Label::new("Cat", 97.1)]);
    let app = App::new(
        settings(vars),
        store.clone(),
        classifier.clone(),
        Arc::new(InMemoryDeadLetterSink::new()),
        Arc::new(InMemoryLedger::new()),
    )
    .unwrap();
    (app, store, classifier)
}

/// Deliver the same record to two function instances sharing a
/// ledger, and count the classifications.
async fn deliver_to_two_instances(mode: &str) -> (usize, Vec<Value>) {
    let store = Arc::new(InMemoryStore::new());
    let classifier = ScriptedClassifier::new(
        vec![Step::Labels(vec![Label::new("Cat", 97.1)])],
        Step::Labels(vec![Label::new("Dog", 61.0)]),
    );
    let ledger: Arc<dyn ResultLedger> = Arc::new(InMemoryLedger::new());
    let instance = || {
        App::new(
            settings(&[("IDEMPOTENCY", mode)]),
            store.clone(),
            classifier.clone(),
            Arc::new(InMemoryDeadLetterSink::new()),
            ledger.clone(),
        )
        .unwrap()
    };
    let (first, second) = (instance(), instance());
    let version = store
        .put(BUCKET, "image1.jpg", Bytes::from_static(b"jpeg"))
        .await
        .unwrap();
    let event: S3Event = serde_json::from_value(json!({
        "Records": [record("ObjectCreated:Put", "image1.jpg", &version)]
    }))
    .unwrap();

    let mut summaries = Vec::new();
    for app in [first, second] {
        let outcomes = app
            .handle_s3_event(&event, &TraceContext::default(), None)
            .await
            .unwrap();
        summaries.push(serde_json::to_value(OutcomeSummary::new(&outcomes[0])).unwrap());
    }
    (classifier.calls(), summaries)
}

#[tokio::test]
async fn ledger_mode_answers_other_instances_from_the_ledger() {
    let (calls, summaries) = deliver_to_two_instances("ledger").await;
    assert_eq!(calls, 1);
    assert_eq!(summaries[0]["status"], "succeeded");
    assert_eq!(summaries[1]["status"], "duplicate");
    assert_eq!(summaries[1]["attempts"], 0);
    assert_eq!(summaries[1]["labels"], summaries[0]["labels"]);
}

#[tokio::test]
async fn deterministic_mode_classifies_again_in_other_instances() {
    let (calls, summaries) = deliver_to_two_instances("deterministic").await;
    assert_eq!(calls, 2);
    assert_eq!(summaries[1]["status"], "succeeded");
    assert_eq!(summaries[1]["labels"][0]["name"], "Dog");
}

#[tokio::test]
async fn matching_creation_records_are_classified() {
    let (app, store, classifier) = app(&[("MATCH_KEY", "uploads/*.jpg")]).await;
    let version = store
        .put(BUCKET, "uploads/my cat.jpg", Bytes::from_static(b"jpeg"))
        .await
        .unwrap();
    store
        .put(BUCKET, "uploads/notes.txt", Bytes::from_static(b"text"))
        .await
        .unwrap();

    let event: S3Event = serde_json::from_value(json!({
        "Records": [
            record("ObjectCreated:Put", "uploads/my+cat.jpg", &version),
            record("ObjectCreated:Put", "uploads/notes.txt", "v2"),
            record("ObjectRemoved:Delete", "uploads/my+cat.jpg", &version),
        ]
    }))
    .unwrap();
    let outcomes = app
        .handle_s3_event(&event, &TraceContext::default(), None)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(classifier.calls(), 1);
    let summary = serde_json::to_value(OutcomeSummary::new(&outcomes[0])).unwrap();
    assert_eq!(summary["key"], "uploads/my cat.jpg");
    assert_eq!(summary["version"], version.as_str());
    assert_eq!(summary["status"], "succeeded");
    assert_eq!(summary["attempts"], 1);
    assert_eq!(summary["labels"][0]["name"], "Cat");
    assert!(summary.get("error").is_none());
}

#[tokio::test]
async fn redelivered_records_report_duplicates() {
    let (app, store, classifier) = app(&[]).await;
    let version = store
        .put(BUCKET, "image1.jpg", Bytes::from_static(b"jpeg"))
        .await
        .unwrap();
    let event: S3Event = serde_json::from_value(json!({
        "Records": [record("ObjectCreated:Put", "image1.jpg", &version)]
    }))
    .unwrap();

    app.handle_s3_event(&event, &TraceContext::default(), None)
        .await
        .unwrap();
    let outcomes = app
        .handle_s3_event(&event, &TraceContext::default(), None)
        .await
        .unwrap();

    let summary = serde_json::to_value(OutcomeSummary::new(&outcomes[0])).unwrap();
    assert_eq!(summary["status"], "duplicate");
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn stale_versions_are_reported_as_dead_lettered() {
    let (app, store, classifier) = app(&[("MAX_RETRIES", "5")]).await;
    store
        .put(BUCKET, "image1.jpg", Bytes::from_static(b"jpeg"))
        .await
        .unwrap();
    let event: S3Event = serde_json::from_value(json!({
        "Records": [record("ObjectCreated:Put", "image1.jpg", "v-does-not-exist")]
    }))
    .unwrap();

    let outcomes = app
        .handle_s3_event(&event, &TraceContext::default(), None)
        .await
        .unwrap();

    let summary = serde_json::to_value(OutcomeSummary::new(&outcomes[0])).unwrap();
    assert_eq!(summary["status"], "dead-lettered");
    assert_eq!(summary["error"], "ObjectNotFound");
    assert_eq!(summary["attempts"], 1);
    assert_eq!(store.get_count(), 1);
    assert_eq!(classifier.calls(), 0);
}
