use anyhow::{Context, Result};
use chrono::Utc;
use image_label_bridge::app::{self, OutcomeSummary};
use image_label_bridge::client;
use image_label_bridge::event::{NotificationEvent, ObjectRecord};
use image_label_bridge::observability::{self, TraceContext};
use std::env::var;

/// Classify a single object, given by the `BUCKET`, `KEY` and
/// optionally `VERSION` environment variables, and print the outcome.
#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = observability::init()?;
    client::init().await?;
    app::init()?;

    let bucket = var("BUCKET").context("BUCKET")?;
    let key = var("KEY").context("KEY")?;
    let version_id = var("VERSION").ok().filter(|v| !v.is_empty());
    let now = Utc::now();
    let event = NotificationEvent::created(
        ObjectRecord {
            bucket,
            key,
            version_id,
            etag: None,
            size: 0,
            created_at: now,
        },
        None,
        now,
    );

    let outcomes = app::current()
        .handle(vec![event], &TraceContext::from_env(), None)
        .await
        .context("Failed to classify the object")?;
    let summaries: Vec<OutcomeSummary> = outcomes.iter().map(OutcomeSummary::new).collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    telemetry.shutdown();
    Ok(())
}
