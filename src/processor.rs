//! Defines the processing unit: a single, stateless attempt at
//! classifying one object version.

use crate::classify::Label;
use crate::error::InvocationError;
use crate::event::{NotificationEvent, ObjectVersion};
use crate::grant::Capabilities;
use crate::observability::TraceContext;
use crate::store::content_digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::field::Empty;
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// One unit of work handed to the processing unit.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub event: NotificationEvent,
    pub trace: TraceContext,
    /// 1 for the first attempt.
    pub attempt: u32,
}

/// The labels produced for one object version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub object: ObjectVersion,
    /// The event that produced this result.
    pub event_id: String,
    pub labels: Vec<Label>,
    /// Digest of the classified bytes.
    pub content_digest: String,
    pub latency_ms: u64,
    pub classified_at: DateTime<Utc>,
}

/// The lifecycle of one invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvocationState {
    Pending,
    Fetching,
    Classifying,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl InvocationState {
    pub fn is_absorbing(self) -> bool {
        matches!(
            self,
            InvocationState::Succeeded | InvocationState::FailedTerminal
        )
    }

    /// Whether `next` may follow this state. A retryable failure
    /// returns to `Pending` through the dispatcher.
    pub fn can_become(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Classifying)
                | (Fetching, FailedRetryable)
                | (Fetching, FailedTerminal)
                | (Classifying, Succeeded)
                | (Classifying, FailedRetryable)
                | (Classifying, FailedTerminal)
                | (FailedRetryable, Pending)
        )
    }

    fn failed(error: &InvocationError) -> Self {
        if error.is_retryable() {
            InvocationState::FailedRetryable
        } else {
            InvocationState::FailedTerminal
        }
    }
}

/// The states an attempt went through, and how it ended.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub states: Vec<InvocationState>,
    pub outcome: Result<ClassificationResult, InvocationError>,
}

impl AttemptReport {
    pub fn state(&self) -> InvocationState {
        self.states
            .last()
            .copied()
            .unwrap_or(InvocationState::Pending)
    }
}

/// Tracks the state of one attempt.
struct StateTrail(Vec<InvocationState>);

impl StateTrail {
    fn new() -> Self {
        StateTrail(vec![InvocationState::Pending])
    }

    fn advance(&mut self, next: InvocationState) {
        let current = self.0.last().copied().unwrap_or(InvocationState::Pending);
        if !current.can_become(next) {
            warn!(?current, ?next, "Unexpected invocation state transition");
        }
        debug!(?current, ?next, "Invocation state transition");
        self.0.push(next);
    }

    fn finish(
        mut self,
        outcome: Result<ClassificationResult, InvocationError>,
    ) -> AttemptReport {
        let next = match &outcome {
            Ok(_) => InvocationState::Succeeded,
            Err(e) => InvocationState::failed(e),
        };
        self.advance(next);
        AttemptReport {
            states: self.0,
            outcome,
        }
    }
}

/// Run `operation` with a time limit, turning an elapsed limit into
/// a retryable failure.
async fn bounded<T, F>(phase: &'static str, limit: Duration, operation: F) -> Result<T, InvocationError>
where
    F: Future<Output = Result<T, InvocationError>>,
{
    timeout(limit, operation)
        .await
        .unwrap_or_else(|_| {
            Err(InvocationError::TimeoutExceeded {
                phase,
                limit_ms: limit.as_millis() as u64,
            })
        })
}

/// Executes invocation attempts. Holds no state between attempts.
#[derive(Debug, Clone)]
pub struct ProcessingUnit {
    fetch_timeout: Duration,
    classify_timeout: Duration,
}

impl ProcessingUnit {
    pub fn new(fetch_timeout: Duration, classify_timeout: Duration) -> Self {
        Self {
            fetch_timeout,
            classify_timeout,
        }
    }

    /// Perform one attempt: fetch the object version, classify it, and
    /// emit the result. Runs within an `invocation` span, child of the
    /// request's trace context.
    pub async fn process(
        &self,
        request: &InvocationRequest,
        capabilities: &Capabilities,
    ) -> AttemptReport {
        let object = &request.event.object;
        let span = info_span!(
            "invocation",
            event_id = %request.event.event_id,
            bucket = %object.bucket,
            key = %object.key,
            version = object.version_tag(),
            attempt = request.attempt,
            outcome = Empty,
        );
        if let Err(e) = span.set_parent(request.trace.parent()) {
            debug!("Couldn't link the invocation to its trace: {:?}", e);
        }
        let report = self.attempt(request, capabilities).instrument(span.clone()).await;
        match &report.outcome {
            Ok(_) => span.record("outcome", "succeeded"),
            Err(e) => span.record("outcome", tracing::field::display(e.kind())),
        };
        report
    }

    async fn attempt(
        &self,
        request: &InvocationRequest,
        capabilities: &Capabilities,
    ) -> AttemptReport {
        let mut trail = StateTrail::new();

        trail.advance(InvocationState::Fetching);
        let fetched = bounded(
            "fetch",
            self.fetch_timeout,
            capabilities.read_object(&request.event.object),
        )
        .instrument(info_span!("fetch"))
        .await;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to fetch object");
                return trail.finish(Err(e));
            }
        };

        trail.advance(InvocationState::Classifying);
        let started = Instant::now();
        let classify_span = info_span!("classify", size = bytes.len(), label_num = Empty);
        let digest = content_digest(&bytes);
        let classified = bounded(
            "classify",
            self.classify_timeout,
            capabilities.classify(bytes),
        )
        .instrument(classify_span.clone())
        .await;
        let labels = match classified {
            Ok(labels) => {
                classify_span.record("label_num", labels.len() as i64);
                labels
            }
            Err(e) => {
                warn!(error = %e, "Failed to classify object");
                return trail.finish(Err(e));
            }
        };

        let result = ClassificationResult {
            object: request.event.object.identity(),
            event_id: request.event.event_id.clone(),
            labels,
            content_digest: digest,
            latency_ms: started.elapsed().as_millis() as u64,
            classified_at: Utc::now(),
        };
        info_span!("emit").in_scope(|| emit(&result));
        trail.finish(Ok(result))
    }
}

/// Publish a result to the log channel.
fn emit(result: &ClassificationResult) {
    info!(
        label_num = result.labels.len(),
        labels = ?result.labels,
        latency_ms = result.latency_ms,
        "classification result"
    );
}
