//! Defines configuration as read from the environment.

use crate::dispatch::{DispatcherConfig, RetryPolicy};
use crate::ledger::IdempotencyMode;
use core::time::Duration;
use serde::Deserialize;

/// Default `max_concurrency` value.
fn default_max_concurrency() -> usize {
    8
}

/// Default `max_retries` value.
fn default_max_retries() -> u32 {
    3
}

/// Default `backoff_base_ms` value.
fn default_backoff_base_ms() -> u64 {
    200
}

/// Default `backoff_max_ms` value.
fn default_backoff_max_ms() -> u64 {
    20_000
}

/// Default `fetch_timeout_secs` and `classify_timeout_secs` value.
fn default_phase_timeout_secs() -> u64 {
    20
}

/// Default `invocation_timeout_secs` value.
fn default_invocation_timeout_secs() -> u64 {
    55
}

/// Default `deadline_margin_ms` value.
fn default_deadline_margin_ms() -> u64 {
    3000
}

/// Default `redelivery_window_secs` value.
fn default_redelivery_window_secs() -> u64 {
    3600
}

/// Default `ledger_prefix` value.
fn default_ledger_prefix() -> String {
    String::from("labels/")
}

/// Default `max_labels` value.
fn default_max_labels() -> i32 {
    10
}

/// Default `min_confidence` value.
fn default_min_confidence() -> f32 {
    55.0
}

/// Default `grant_ttl_secs` value.
fn default_grant_ttl_secs() -> i64 {
    900
}

/// Default `principal` value.
fn default_principal() -> String {
    String::from("image-label-bridge")
}

/// The bridge receives object creation events, fetches each created
/// object and labels it with the classification service. The
/// configuration must be given as environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Defines a filter to select only matching keys. The star (*)
    /// can be used as a wildcard matching any number of non-slash
    /// characters. E.g. to match any JPEG in a folder, use
    /// `"folder/*.jpg"`. Omitting this will make it match any file.
    #[serde(default)]
    pub match_key: Option<String>,

    /// Maximum number of objects being processed at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retries of a transiently failing object before it's sent to
    /// the dead-letter queue.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait before the first retry, doubled on each subsequent one.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the wait between retries.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_phase_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_phase_timeout_secs")]
    pub classify_timeout_secs: u64,

    /// Budget of a single attempt, fetch and classification
    /// included. Retries of an event are further bounded by the
    /// deadline of the delivery, when it has one (the function's
    /// timeout, or the SQS visibility timeout).
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Time kept free before a delivery's deadline to record the
    /// outcome of its events.
    #[serde(default = "default_deadline_margin_ms")]
    pub deadline_margin_ms: u64,

    /// How long outcomes are remembered in memory to answer
    /// redeliveries. Older redeliveries fall back to the ledger.
    #[serde(default = "default_redelivery_window_secs")]
    pub redelivery_window_secs: u64,

    /// Maximum number of labels requested per image.
    #[serde(default = "default_max_labels")]
    pub max_labels: i32,

    /// Minimum confidence of the labels requested.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Either `deterministic`, to rely on the classifier returning
    /// identical labels for identical images, or `ledger`, to keep
    /// the first result of each object version as canonical.
    #[serde(default)]
    pub idempotency: IdempotencyMode,

    /// Bucket holding one result marker per classified object
    /// version, shared by every function instance and consumer. If
    /// omitted, the ledger is kept in memory by each process.
    #[serde(default)]
    pub ledger_bucket: Option<String>,

    /// Prefix of the result markers in `ledger_bucket`.
    #[serde(default = "default_ledger_prefix")]
    pub ledger_prefix: String,

    /// SQS queue receiving events that can't be processed. If
    /// omitted, such events are only logged.
    #[serde(default)]
    pub dead_letter_queue_url: Option<String>,

    /// The identity invocations run as.
    #[serde(default = "default_principal")]
    pub principal: String,

    /// The only bucket invocations may read from. If omitted, each
    /// invocation is granted the bucket of its event.
    #[serde(default)]
    pub allowed_bucket: Option<String>,

    /// Lifetime of each invocation's grant.
    #[serde(default = "default_grant_ttl_secs")]
    pub grant_ttl_secs: i64,
}

impl Settings {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrency: self.max_concurrency,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
            },
            invocation_timeout: Duration::from_secs(self.invocation_timeout_secs),
            deadline_margin: Duration::from_millis(self.deadline_margin_ms),
            redelivery_window: Duration::from_secs(self.redelivery_window_secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs)
    }

    pub fn grant_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grant_ttl_secs)
    }
}
