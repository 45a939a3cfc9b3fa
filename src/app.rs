//! Defines the read-only application state and hub for utility
//! functions.

use crate::classify::{Classifier, RekognitionClassifier};
use crate::client;
use crate::conf::Settings;
use crate::deadletter::{DeadLetterSink, LogDeadLetterSink, SqsDeadLetterSink};
use crate::dispatch::{Dispatcher, InvocationOutcome, Terminal};
use crate::event::NotificationEvent;
use crate::grant::GrantIssuer;
use crate::ledger::{IdempotencyMode, InMemoryLedger, ResultLedger, S3Ledger};
use crate::observability::TraceContext;
use crate::processor::ProcessingUnit;
use crate::store::{ObjectStore, S3Store};
use anyhow::{anyhow, Context, Result};
use aws_lambda_events::event::s3::S3Event;
use envy::from_env;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// An App is an initialized application state, derived from
/// settings. This is only useful to pre-compute stuff that will be
/// used constantly.
pub struct App {
    /// The original settings.
    pub settings: Settings,

    /// The regex that matches S3 event keys.
    pub match_key_re: Regex,

    /// The dispatcher that drives every event to its outcome.
    pub dispatcher: Arc<Dispatcher>,
}

/// Compile a key glob into a regex, where `*` matches any number of
/// non-slash characters.
pub fn key_glob(glob: &str) -> Result<Regex> {
    Ok(Regex::new(&format!(
        "^{}$",
        glob.split('*').map(regex::escape).collect::<Vec<String>>().join("[^/]*?")
    ))?)
}

/// A serializable summary of one outcome, as returned to callers.
#[derive(Debug, Serialize)]
pub struct OutcomeSummary<'a> {
    pub event_id: &'a str,
    pub key: &'a str,
    pub version: &'a str,
    pub status: &'static str,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<&'a [crate::classify::Label]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<'a> OutcomeSummary<'a> {
    pub fn new(outcome: &'a InvocationOutcome) -> Self {
        let duplicate = outcome.is_duplicate();
        match outcome.terminal() {
            Terminal::Succeeded { result, attempts } => OutcomeSummary {
                event_id: &result.event_id,
                key: &result.object.key,
                version: &result.object.version,
                status: if duplicate { "duplicate" } else { "succeeded" },
                attempts: *attempts,
                labels: Some(&result.labels),
                error: None,
            },
            Terminal::DeadLettered(entry) => OutcomeSummary {
                event_id: &entry.event.event_id,
                key: &entry.event.object.key,
                version: entry.event.object.version_tag(),
                status: if duplicate { "duplicate" } else { "dead-lettered" },
                attempts: entry.attempts,
                labels: None,
                error: Some(entry.last_error.to_string()),
            },
        }
    }
}

impl App {
    /// Initialize an App instance given a settings struct and the
    /// collaborators it works with. Consumes the settings struct. The
    /// ledger is only used in the `ledger` idempotency mode.
    pub fn new(
        settings: Settings,
        store: Arc<dyn ObjectStore>,
        classifier: Arc<dyn Classifier>,
        dead_letters: Arc<dyn DeadLetterSink>,
        ledger: Arc<dyn ResultLedger>,
    ) -> Result<Self> {
        // Parse regexes
        let match_key_re = if let Some(match_key) = &settings.match_key {
            key_glob(match_key)?
        } else {
            Regex::new("")?
        };
        // Assemble the dispatcher
        let issuer = GrantIssuer::new(
            settings.principal.clone(),
            settings.allowed_bucket.clone(),
            settings.grant_ttl(),
        );
        let processor = ProcessingUnit::new(settings.fetch_timeout(), settings.classify_timeout());
        let mut dispatcher = Dispatcher::new(
            settings.dispatcher_config(),
            issuer,
            store,
            classifier,
            processor,
            dead_letters,
        );
        if settings.idempotency == IdempotencyMode::Ledger {
            dispatcher = dispatcher.with_ledger(ledger);
        }
        let dispatcher = Arc::new(dispatcher);
        // Done
        Ok(App {
            settings,
            match_key_re,
            dispatcher,
        })
    }

    /// Whether objects under `key` are to be classified.
    pub fn matches(&self, key: &str) -> bool {
        self.match_key_re.is_match(key)
    }

    /// Extract the notifications an S3 event carries for matching keys.
    pub fn notifications(&self, event: &S3Event) -> Vec<NotificationEvent> {
        NotificationEvent::from_s3_event(event)
            .into_iter()
            .filter(|notification| {
                let matches = self.matches(&notification.object.key);
                if !matches {
                    debug!(key = %notification.object.key, "Key doesn't match; skipping");
                }
                matches
            })
            .collect()
    }

    /// Drive a batch of notifications to their outcomes, before
    /// `deadline` if given. Fails if any outcome couldn't be
    /// recorded, so that the batch is delivered again.
    #[instrument(skip(self, events, trace, deadline), fields(events = events.len()))]
    pub async fn handle(
        &self,
        events: Vec<NotificationEvent>,
        trace: &TraceContext,
        deadline: Option<Instant>,
    ) -> Result<Vec<InvocationOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for outcome in self
            .dispatcher
            .dispatch_all(events, trace.clone(), deadline)
            .await
        {
            outcomes.push(outcome.context("Failed to record the outcome of an event")?);
        }
        info!(outcomes = outcomes.len(), "Handled events");
        Ok(outcomes)
    }

    /// Handle every matching record of an S3 event.
    pub async fn handle_s3_event(
        &self,
        event: &S3Event,
        trace: &TraceContext,
        deadline: Option<Instant>,
    ) -> Result<Vec<InvocationOutcome>> {
        self.handle(self.notifications(event), trace, deadline).await
    }
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance, backed by S3, Rekognition and
/// SQS. Requires the global client to be initialized.
pub fn init() -> Result<()> {
    let settings: Settings = from_env()?;
    let dead_letters: Arc<dyn DeadLetterSink> = match &settings.dead_letter_queue_url {
        Some(queue_url) => Arc::new(SqsDeadLetterSink::new(client::sqs(), queue_url.clone())),
        None => Arc::new(LogDeadLetterSink),
    };
    let classifier = Arc::new(RekognitionClassifier::new(
        client::rekognition(),
        settings.max_labels,
        settings.min_confidence,
    ));
    let ledger: Arc<dyn ResultLedger> = match &settings.ledger_bucket {
        Some(bucket) => Arc::new(S3Ledger::new(
            client::s3(),
            bucket.clone(),
            settings.ledger_prefix.clone(),
        )),
        None => Arc::new(InMemoryLedger::new()),
    };
    let app = App::new(
        settings,
        Arc::new(S3Store::new(client::s3())),
        classifier,
        dead_letters,
        ledger,
    )?;
    CURRENT
        .set(app)
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}
