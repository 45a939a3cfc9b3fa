//! Defines the dead-letter sink: the terminal destination for events
//! that hit a non-retryable error or exhausted their retries.

use crate::error::{ErrorKind, InvocationError};
use crate::event::NotificationEvent;
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info};

/// An event that won't be processed any further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: NotificationEvent,
    pub attempts: u32,
    pub last_error: ErrorKind,
    /// Human-readable failure detail, for operator triage.
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(event: NotificationEvent, attempts: u32, error: &InvocationError) -> Self {
        Self {
            event,
            attempts,
            last_error: error.kind(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("failed to serialize dead-letter entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to deliver dead-letter entry to {queue_url:?}: {reason}")]
    Delivery { queue_url: String, reason: String },
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError>;
}

/// Sends dead-letter entries as JSON messages to an SQS queue.
#[derive(Debug, Clone)]
pub struct SqsDeadLetterSink {
    client: Client,
    queue_url: String,
}

impl SqsDeadLetterSink {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetterSink {
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let body = serde_json::to_string(entry)?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| DeadLetterError::Delivery {
                queue_url: self.queue_url.clone(),
                reason: format!("{:?}", e),
            })?;
        info!(
            event_id = %entry.event.event_id,
            queue_url = %self.queue_url,
            "Dead-lettered event"
        );
        Ok(())
    }
}

/// Writes dead-letter entries to the log. Used when no queue is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let body = serde_json::to_string(entry)?;
        error!(
            event_id = %entry.event.event_id,
            last_error = %entry.last_error,
            attempts = entry.attempts,
            entry = %body,
            "Dead-lettered event"
        );
        Ok(())
    }
}

/// Keeps dead-letter entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}
