//! Defines the invocation dispatcher: it maps each notification to
//! invocation attempts, bounds how many run at once, retries
//! transient failures with exponential backoff, and routes terminal
//! failures to the dead-letter sink.

use crate::classify::Classifier;
use crate::deadletter::{DeadLetterEntry, DeadLetterError, DeadLetterSink};
use crate::error::InvocationError;
use crate::event::{NotificationEvent, ObjectVersion};
use crate::grant::{Capabilities, GrantIssuer};
use crate::ledger::ResultLedger;
use crate::observability::TraceContext;
use crate::processor::{ClassificationResult, InvocationRequest, ProcessingUnit};
use crate::store::ObjectStore;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Exponential backoff between attempts of the same event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. A retryable failure is
    /// dead-lettered after `max_retries + 1` attempts.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub backoff_base: Duration,
    /// Upper bound of any single wait.
    pub backoff_max: Duration,
}

/// The base of the exponential backoff sequence.
const BACKOFF_BASE: u32 = 2;

impl RetryPolicy {
    /// The wait after attempt number `attempt` failed (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.backoff_base.saturating_mul(factor), self.backoff_max)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ceiling of simultaneously running invocations. Requests over
    /// the ceiling wait for a slot.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Overall budget of a single attempt. Exceeding it cancels the
    /// attempt.
    pub invocation_timeout: Duration,
    /// Time kept free before an event's deadline, to record its
    /// outcome.
    pub deadline_margin: Duration,
    /// How long terminal outcomes are remembered to answer
    /// redeliveries.
    pub redelivery_window: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            retry: RetryPolicy::default(),
            invocation_timeout: Duration::from_secs(55),
            deadline_margin: Duration::from_secs(3),
            redelivery_window: Duration::from_secs(3600),
        }
    }
}

/// How an object version ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Succeeded {
        result: ClassificationResult,
        attempts: u32,
    },
    DeadLettered(DeadLetterEntry),
}

impl Terminal {
    pub fn attempts(&self) -> u32 {
        match self {
            Terminal::Succeeded { attempts, .. } => *attempts,
            Terminal::DeadLettered(entry) => entry.attempts,
        }
    }
}

/// The answer to a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// This dispatch drove the object version to its terminal state.
    Finished(Terminal),
    /// The object version already had a terminal state; nothing was
    /// invoked.
    Duplicate(Terminal),
}

impl InvocationOutcome {
    pub fn terminal(&self) -> &Terminal {
        match self {
            InvocationOutcome::Finished(terminal) | InvocationOutcome::Duplicate(terminal) => {
                terminal
            }
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InvocationOutcome::Duplicate(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The outcome couldn't be recorded; the event must be delivered
    /// again.
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error("dispatcher is shut down")]
    Closed,

    #[error("dispatch task failed: {0}")]
    Task(String),
}

/// Counts an invocation as in flight while alive.
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        InFlight { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The point in time by which an event must reach its outcome.
#[derive(Debug, Clone, Copy)]
struct Budget {
    deadline: Instant,
    total: Duration,
}

impl Budget {
    fn until(deadline: Instant) -> Self {
        Budget {
            deadline,
            total: deadline.saturating_duration_since(Instant::now()),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn exceeded(&self) -> InvocationError {
        InvocationError::TimeoutExceeded {
            phase: "event",
            limit_ms: self.total.as_millis() as u64,
        }
    }
}

/// A terminal outcome, or the wait for one, and when it was first
/// requested.
struct TerminalSlot {
    since: Instant,
    cell: Arc<OnceCell<Terminal>>,
}

/// Drives notifications to a terminal outcome.
pub struct Dispatcher {
    config: DispatcherConfig,
    issuer: GrantIssuer,
    store: Arc<dyn ObjectStore>,
    classifier: Arc<dyn Classifier>,
    processor: ProcessingUnit,
    dead_letters: Arc<dyn DeadLetterSink>,
    ledger: Option<Arc<dyn ResultLedger>>,
    permits: Semaphore,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    terminals: Mutex<HashMap<ObjectVersion, TerminalSlot>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        issuer: GrantIssuer,
        store: Arc<dyn ObjectStore>,
        classifier: Arc<dyn Classifier>,
        processor: ProcessingUnit,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            config,
            issuer,
            store,
            classifier,
            processor,
            dead_letters,
            ledger: None,
            permits,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            terminals: Mutex::new(HashMap::new()),
        }
    }

    /// Consult `ledger` before running an event, and record every
    /// success in it, so that redeliveries reaching other dispatchers
    /// reuse the canonical result.
    pub fn with_ledger(mut self, ledger: Arc<dyn ResultLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Invocations running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// The recorded terminal state of an object version, if any.
    pub fn terminal(&self, object: &ObjectVersion) -> Option<Terminal> {
        self.terminals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object)
            .and_then(|slot| slot.cell.get().cloned())
    }

    /// Object versions currently remembered.
    pub fn remembered(&self) -> usize {
        self.terminals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Find or create the slot of an object version, forgetting
    /// outcomes older than the redelivery window. Slots still waiting
    /// for an outcome are kept.
    fn terminal_cell(&self, object: ObjectVersion) -> Arc<OnceCell<Terminal>> {
        let window = self.config.redelivery_window;
        let mut terminals = self.terminals.lock().unwrap_or_else(PoisonError::into_inner);
        let before = terminals.len();
        terminals.retain(|_, slot| !slot.cell.initialized() || slot.since.elapsed() < window);
        if terminals.len() < before {
            debug!(evicted = before - terminals.len(), "Forgot old outcomes");
        }
        terminals
            .entry(object)
            .or_insert_with(|| TerminalSlot {
                since: Instant::now(),
                cell: Arc::new(OnceCell::new()),
            })
            .cell
            .clone()
    }

    /// Drive one notification to a terminal outcome. Concurrent and
    /// later deliveries of the same object version wait for, and then
    /// report, the first one's outcome.
    pub async fn dispatch(
        &self,
        event: NotificationEvent,
        trace: TraceContext,
    ) -> Result<InvocationOutcome, DispatchError> {
        self.dispatch_until(event, trace, None).await
    }

    /// Like [`Dispatcher::dispatch`], but stops retrying in time to
    /// record the outcome before `deadline`.
    #[instrument(skip_all, fields(event_id = %event.event_id))]
    pub async fn dispatch_until(
        &self,
        event: NotificationEvent,
        trace: TraceContext,
        deadline: Option<Instant>,
    ) -> Result<InvocationOutcome, DispatchError> {
        let identity = event.object.identity();
        let cell = self.terminal_cell(identity.clone());
        let ran = AtomicBool::new(false);
        let terminal = cell
            .get_or_try_init(|| async {
                if let Some(recorded) = self.recorded(&identity).await {
                    return Ok(recorded);
                }
                ran.store(true, Ordering::SeqCst);
                let deadline = deadline.map(|deadline| {
                    deadline
                        .checked_sub(self.config.deadline_margin)
                        .unwrap_or(deadline)
                });
                self.run(event, trace, deadline.map(Budget::until)).await
            })
            .await?
            .clone();
        if ran.load(Ordering::SeqCst) {
            Ok(InvocationOutcome::Finished(terminal))
        } else {
            info!("Event was already handled; ignoring redelivery");
            Ok(InvocationOutcome::Duplicate(terminal))
        }
    }

    /// The outcome another delivery recorded in the ledger. Nothing
    /// was attempted for it here.
    async fn recorded(&self, object: &ObjectVersion) -> Option<Terminal> {
        let result = self.ledger.as_ref()?.lookup(object).await?;
        info!(object = %object, "Object version was already classified");
        Some(Terminal::Succeeded {
            result,
            attempts: 0,
        })
    }

    /// Attempt an event until it succeeds, fails terminally, runs out
    /// of retries, or runs out of time.
    async fn run(
        &self,
        event: NotificationEvent,
        trace: TraceContext,
        budget: Option<Budget>,
    ) -> Result<Terminal, DispatchError> {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            let request = InvocationRequest {
                event: event.clone(),
                trace: trace.clone(),
                attempt,
            };
            let mut error = match self.attempt(&request, budget).await? {
                Ok(result) => {
                    info!(attempts = attempt, "Invocation succeeded");
                    let result = match &self.ledger {
                        Some(ledger) => ledger.record(result).await,
                        None => result,
                    };
                    return Ok(Terminal::Succeeded {
                        result,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };
            if error.is_retryable() && attempt < retry.max_attempts() {
                let delay = retry.delay(attempt);
                match budget {
                    Some(budget) if budget.remaining() <= delay => {
                        warn!(attempt, error = %error, "No time left for another attempt");
                        error = budget.exceeded();
                    }
                    _ => {
                        warn!(
                            attempt,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "Invocation failed; retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                }
            }
            let entry = DeadLetterEntry::new(event, attempt, &error);
            error!(
                attempts = attempt,
                last_error = %entry.last_error,
                reason = %entry.reason,
                "Invocation failed terminally"
            );
            self.dead_letters.send(&entry).await?;
            return Ok(Terminal::DeadLettered(entry));
        }
    }

    /// A single attempt: wait for a slot, attach a fresh grant, and
    /// run the processing unit within the overall budget.
    async fn attempt(
        &self,
        request: &InvocationRequest,
        budget: Option<Budget>,
    ) -> Result<Result<ClassificationResult, InvocationError>, DispatchError> {
        let permit = match budget {
            Some(budget) => match timeout_at(budget.deadline, self.permits.acquire()).await {
                Ok(permit) => permit,
                Err(_) => return Ok(Err(budget.exceeded())),
            },
            None => self.permits.acquire().await,
        };
        let _permit = permit.map_err(|_| DispatchError::Closed)?;
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let grant = match self.issuer.issue(&request.event.object.bucket) {
            Ok(grant) => grant,
            Err(e) => return Ok(Err(e)),
        };
        let capabilities = Capabilities::attach(grant, self.store.clone(), self.classifier.clone());
        // The event's deadline cuts the attempt short when it comes
        // first.
        let limit = self.config.invocation_timeout;
        let (limit, cut_short) = match budget {
            Some(budget) if budget.remaining() < limit => (budget.remaining(), Some(budget)),
            _ => (limit, None),
        };
        Ok(
            match timeout(limit, self.processor.process(request, &capabilities)).await {
                Ok(report) => report.outcome,
                Err(_) => Err(match cut_short {
                    Some(budget) => budget.exceeded(),
                    None => InvocationError::TimeoutExceeded {
                        phase: "invocation",
                        limit_ms: limit.as_millis() as u64,
                    },
                }),
            },
        )
    }

    /// Dispatch a batch of events concurrently, returning their
    /// outcomes in the same order.
    pub async fn dispatch_all(
        self: &Arc<Self>,
        events: Vec<NotificationEvent>,
        trace: TraceContext,
        deadline: Option<Instant>,
    ) -> Vec<Result<InvocationOutcome, DispatchError>> {
        let mut tasks = JoinSet::new();
        let total = events.len();
        for (index, event) in events.into_iter().enumerate() {
            let dispatcher = Arc::clone(self);
            let trace = trace.clone();
            tasks.spawn(async move {
                (
                    index,
                    dispatcher.dispatch_until(event, trace, deadline).await,
                )
            });
        }
        let mut outcomes: Vec<Option<Result<InvocationOutcome, DispatchError>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!("Dispatch task failed: {:?}", e),
            }
        }
        outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or_else(|| Err(DispatchError::Task(String::from("task aborted")))))
            .collect()
    }

    /// Dispatch every notification received until the channel closes.
    pub async fn serve(
        self: Arc<Self>,
        mut notifications: UnboundedReceiver<NotificationEvent>,
    ) -> Vec<Result<InvocationOutcome, DispatchError>> {
        let mut tasks = JoinSet::new();
        while let Some(event) = notifications.recv().await {
            let dispatcher = Arc::clone(&self);
            tasks.spawn(async move { dispatcher.dispatch(event, TraceContext::default()).await });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.unwrap_or_else(|e| Err(DispatchError::Task(e.to_string()))));
        }
        outcomes
    }
}
