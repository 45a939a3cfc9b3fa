//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use image_label_bridge::classify::{ClassifyError, Classifier, Label};
use image_label_bridge::deadletter::{
    DeadLetterEntry, DeadLetterError, DeadLetterSink, InMemoryDeadLetterSink,
};
use image_label_bridge::dispatch::{Dispatcher, DispatcherConfig, RetryPolicy};
use image_label_bridge::event::NotificationEvent;
use image_label_bridge::grant::GrantIssuer;
use image_label_bridge::ledger::{InMemoryLedger, ResultLedger};
use image_label_bridge::processor::ProcessingUnit;
use image_label_bridge::store::{InMemoryStore, ObjectStore};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const BUCKET: &str = "images";

/// One scripted answer of the classifier.
#[derive(Debug, Clone)]
pub enum Step {
    Labels(Vec<Label>),
    Fail(ClassifyError),
    /// Answer after a while.
    Slow(Duration, Vec<Label>),
    /// Never answer in any reasonable time.
    Hang,
}

/// A classifier that follows a script, then repeats a fallback step.
/// Counts calls and tracks how many run at once.
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Always answer with `labels`.
    pub fn always(labels: Vec<Label>) -> Arc<Self> {
        Self::new(Vec::new(), Step::Labels(labels))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _image: Bytes) -> Result<Vec<Label>, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let answer = match step {
            Step::Labels(labels) => Ok(labels),
            Step::Fail(error) => Err(error),
            Step::Slow(delay, labels) => {
                tokio::time::sleep(delay).await;
                Ok(labels)
            }
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(Vec::new())
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

/// A dead-letter sink that refuses the first `failures` entries.
pub struct FlakyDeadLetterSink {
    failures: AtomicUsize,
    pub inner: InMemoryDeadLetterSink,
}

impl FlakyDeadLetterSink {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            inner: InMemoryDeadLetterSink::new(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for FlakyDeadLetterSink {
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DeadLetterError::Delivery {
                queue_url: String::from("https://sqs.us-east-1.amazonaws.com/0/dead-letters"),
                reason: String::from("ServiceUnavailable"),
            });
        }
        self.inner.send(entry).await
    }
}

/// The collaborators of a dispatcher under test.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub classifier: Arc<ScriptedClassifier>,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
    pub ledger: Arc<InMemoryLedger>,
    pub dispatcher: Arc<Dispatcher>,
}

/// A dispatcher over the given collaborators, with 20s fetch and
/// classification timeouts.
pub fn dispatcher(
    config: DispatcherConfig,
    issuer: GrantIssuer,
    store: Arc<InMemoryStore>,
    classifier: Arc<ScriptedClassifier>,
    dead_letters: Arc<dyn DeadLetterSink>,
    ledger: Option<Arc<dyn ResultLedger>>,
) -> Arc<Dispatcher> {
    let processor = ProcessingUnit::new(Duration::from_secs(20), Duration::from_secs(20));
    let dispatcher = Dispatcher::new(config, issuer, store, classifier, processor, dead_letters);
    Arc::new(match ledger {
        Some(ledger) => dispatcher.with_ledger(ledger),
        None => dispatcher,
    })
}

pub fn issuer() -> GrantIssuer {
    GrantIssuer::new("image-labeler", None, chrono::Duration::hours(48))
}

pub fn config(max_concurrency: usize, max_retries: u32) -> DispatcherConfig {
    DispatcherConfig {
        max_concurrency,
        retry: RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        },
        invocation_timeout: Duration::from_secs(55),
        ..DispatcherConfig::default()
    }
}

impl Harness {
    pub fn new(classifier: Arc<ScriptedClassifier>, config: DispatcherConfig) -> Self {
        Self::with_issuer(classifier, config, issuer())
    }

    pub fn with_issuer(
        classifier: Arc<ScriptedClassifier>,
        config: DispatcherConfig,
        issuer: GrantIssuer,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let dispatcher = dispatcher(
            config,
            issuer,
            store.clone(),
            classifier.clone(),
            dead_letters.clone(),
            Some(ledger.clone()),
        );
        Self {
            store,
            classifier,
            dead_letters,
            ledger,
            dispatcher,
        }
    }

    /// Write an object and return the notification the store emitted
    /// for it.
    pub async fn write(&self, key: &str, size: usize) -> NotificationEvent {
        let mut notifications = self.store.subscribe();
        self.store
            .put(BUCKET, key, Bytes::from(vec![0xFFu8; size]))
            .await
            .unwrap();
        notifications.recv().await.unwrap()
    }
}

/// Records spans with their fields, and the messages of events.
#[derive(Clone, Default)]
pub struct Recorder {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
    messages: Arc<Mutex<Vec<String>>>,
}

#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl RecordedSpan {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Recorder {
    pub fn spans(&self) -> Vec<String> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .map(|span| span.name.clone())
            .collect()
    }

    /// Every recorded span called `name`.
    pub fn spans_named(&self, name: &str) -> Vec<RecordedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|span| span.name == name)
            .cloned()
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

struct MessageVisitor<'a>(&'a mut Option<String>);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{:?}", value));
        }
    }
}

struct FieldVisitor<'a>(&'a mut Vec<(String, String)>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.push((field.name().to_string(), format!("{:?}", value)));
    }
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut fields = Vec::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        self.spans.lock().unwrap().push(RecordedSpan {
            name: attrs.metadata().name().to_string(),
            fields,
        });
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        event.record(&mut MessageVisitor(&mut message));
        if let Some(message) = message {
            self.messages.lock().unwrap().push(message);
        }
    }
}
