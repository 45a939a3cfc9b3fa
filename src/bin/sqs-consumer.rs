use anyhow::{Context, Result};
use aws_lambda_events::event::s3::S3Event;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, Message, MessageSystemAttributeName, QueueAttributeName,
};
use aws_sdk_sqs::Client;
use core::time::Duration;
use image_label_bridge::observability::{self, TraceContext};
use image_label_bridge::{app, client};
use std::env::var;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

/// The minimum time to wait between ticks, in milliseconds.
const BASE_LAPSE_TIME: u64 = 300;

/// The base of the exponential backoff sequence.
const BACKOFF_BASE: u64 = 2;

/// The maximum amount of milliseconds to sleep between ticks. Set to
/// the equivalent of 20 minutes.
const MAX_SLEEP: u64 = 1200000;

/// Wrapper structure that executes successive SQS consumption cycles:
/// receive messages, parse their contents, dispatch the notifications
/// they carry, and finally delete the messages whose notifications
/// all reached an outcome.
struct SQSConsumer {
    queue_url: String,
    visibility_timeout: i32,
    max_number_of_messages: i32,
    client: Client,
    backoff: u32,
}

/// Extract the trace header SQS attaches to messages sent from a
/// traced producer.
fn trace_context(message: &Message) -> TraceContext {
    TraceContext::from_xray(
        message
            .attributes()
            .and_then(|attributes| attributes.get(&MessageSystemAttributeName::AwsTraceHeader))
            .cloned(),
    )
}

impl SQSConsumer {
    /// Record a success and wait a little while.
    async fn pass(&mut self) {
        self.backoff = 0;
        sleep(Duration::from_millis(BASE_LAPSE_TIME)).await;
    }

    /// Record a failure and wait a while.
    async fn fail(&mut self) {
        sleep(Duration::from_millis(std::cmp::min(
            BASE_LAPSE_TIME.saturating_mul(BACKOFF_BASE.saturating_pow(self.backoff)),
            MAX_SLEEP,
        )))
        .await;
        self.backoff = self.backoff.saturating_add(1);
    }

    /// Dispatch the notifications of each message, and return the
    /// messages that can be deleted. Outcomes must be reached before
    /// `deadline`, when the messages become visible again.
    async fn handle_messages(messages: &[Message], deadline: Instant) -> Vec<&Message> {
        let mut tasks = JoinSet::new();
        for (index, message) in messages.iter().enumerate() {
            let Some(body) = message.body() else {
                continue;
            };
            let event: S3Event = match serde_json::from_str(body) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Couldn't parse the body of SQS message: {:?}", e);
                    continue;
                }
            };
            let trace = trace_context(message);
            tasks.spawn(async move {
                let result = app::current()
                    .handle_s3_event(&event, &trace, Some(deadline))
                    .await;
                (index, result)
            });
        }

        let mut undeletable = vec![false; messages.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => (),
                Ok((index, Err(e))) => {
                    warn!(
                        "Error encountered while handling events; SQS message won't be deleted: {:?}",
                        e
                    );
                    undeletable[index] = true;
                }
                Err(e) => {
                    // The message index is lost with the task; keep
                    // every message for redelivery.
                    warn!("Handling task failed; SQS messages won't be deleted: {:?}", e);
                    return Vec::new();
                }
            }
        }
        messages
            .iter()
            .zip(undeletable)
            .filter(|(_, undeletable)| !undeletable)
            .map(|(message, _)| message)
            .collect()
    }

    /// Perform a single pass of the SQS consumption cycle.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) {
        let received_at = Instant::now();
        let command_result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .visibility_timeout(self.visibility_timeout)
            .max_number_of_messages(self.max_number_of_messages)
            .attribute_names(QueueAttributeName::All)
            .wait_time_seconds(20)
            .send()
            .await;
        let result = match command_result {
            Ok(result) => result,
            Err(e) => {
                warn!("Error while consuming messages from SQS queue: {:?}", e);
                return self.fail().await;
            }
        };
        let messages = result.messages().unwrap_or_default();
        if messages.is_empty() {
            return self.pass().await;
        }

        let deadline =
            received_at + Duration::from_secs(self.visibility_timeout.max(0) as u64);
        let deletable = Self::handle_messages(messages, deadline).await;
        if deletable.is_empty() {
            return self.pass().await;
        }
        info!("Deleting {} SQS messages", deletable.len());
        let delete_command_result = self
            .client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(
                deletable
                    .iter()
                    .map(|message| {
                        DeleteMessageBatchRequestEntry::builder()
                            .set_id(message.message_id().map(String::from))
                            .set_receipt_handle(message.receipt_handle().map(String::from))
                            .build()
                    })
                    .collect(),
            ))
            .send()
            .await;
        let result = match delete_command_result {
            Ok(result) => result,
            Err(e) => {
                warn!("Couldn't delete SQS messages: {:?}", e);
                return self.fail().await;
            }
        };
        if !result.failed().unwrap_or_default().is_empty() {
            let failed = result.failed().unwrap_or_default().len();
            let total = deletable.len();
            warn!(
                "Couldn't delete some SQS messages: {:?} out of {:?} weren't deleted",
                failed, total
            );
        }
        self.pass().await;
    }
}

/// Continuously consume S3 notifications from an SQS queue, and
/// label every created object with the classification service.
#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = observability::init()?;
    client::init().await?;
    app::init()?;

    let queue_url = var("SQS_QUEUE_URL").context("SQS_QUEUE_URL is required")?;
    let visibility_timeout = var("SQS_VISIBILITY_TIMEOUT")
        .unwrap_or(String::from("300"))
        .parse::<i32>()
        .context("SQS_VISIBILITY_TIMEOUT must be a number")?;
    let max_number_of_messages = var("SQS_MAX_NUMBER_OF_MESSAGES")
        .unwrap_or(String::from("10"))
        .parse::<i32>()
        .context("SQS_MAX_NUMBER_OF_MESSAGES must be a number")?;

    let mut consumer = SQSConsumer {
        queue_url,
        visibility_timeout,
        max_number_of_messages,
        client: client::sqs(),
        backoff: 0,
    };

    // Listen for abort signals
    let (stop_processing, mut should_stop) = tokio::sync::oneshot::channel();
    tokio::spawn(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Couldn't listen for CTRL-C: {:?}", e);
            return;
        }
        info!("CTRL-C");
        let _ = stop_processing.send(());
    });

    // Continuously receive messages and dispatch the notifications
    // they carry
    loop {
        tokio::select! {
            _ = consumer.tick() => (),
            _ = &mut should_stop => break
        }
    }
    telemetry.shutdown();
    Ok(())
}
