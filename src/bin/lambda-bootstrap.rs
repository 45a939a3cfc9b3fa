use anyhow::{anyhow, Result};
use aws_lambda_events::event::s3::S3Event;
use aws_lambda_events::event::sqs::SqsEventObj;
use image_label_bridge::app::{self, OutcomeSummary};
use image_label_bridge::client;
use image_label_bridge::observability::{self, Telemetry, TraceContext};
use lambda_runtime::{run, service_fn, LambdaEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// The function is either triggered directly by S3, or through an
/// SQS queue receiving S3 notifications.
#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Sqs(SqsEventObj<S3Event>),
    S3(S3Event),
}

impl Payload {
    fn into_s3_events(self) -> Vec<S3Event> {
        match self {
            Payload::Sqs(event) => event.records.into_iter().map(|record| record.body).collect(),
            Payload::S3(event) => vec![event],
        }
    }
}

/// The function's deadline, given in milliseconds since the epoch,
/// as a point on the runtime's clock.
fn deadline(deadline_ms: u64) -> Instant {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Instant::now() + Duration::from_millis(deadline_ms).saturating_sub(now)
}

/// Classify each object created according to the incoming S3 events
async fn function_handler(event: LambdaEvent<Payload>, telemetry: &Telemetry) -> Result<Value> {
    let trace = TraceContext::from_xray(event.context.xray_trace_id.clone());
    let deadline = deadline(event.context.deadline);
    let mut outcomes = Vec::new();
    let mut handled = Ok(());
    for s3_event in event.payload.into_s3_events() {
        match app::current()
            .handle_s3_event(&s3_event, &trace, Some(deadline))
            .await
        {
            Ok(batch) => outcomes.extend(batch),
            Err(e) => {
                handled = Err(e);
                break;
            }
        }
    }
    telemetry.flush();
    handled?;
    Ok(json!({
        "outcomes": outcomes.iter().map(OutcomeSummary::new).collect::<Vec<_>>()
    }))
}

/// Run an AWS Lambda function that listens to S3 events, either
/// directly or in batches through SQS, and labels every created
/// object with the classification service.
#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = observability::init()?;
    client::init().await?;
    app::init()?;

    let result = run(service_fn(|event| function_handler(event, &telemetry)))
        .await
        .map_err(|e| anyhow!("{:?}", e));
    telemetry.shutdown();
    result
}
