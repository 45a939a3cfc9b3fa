//! Defines the global AWS configuration and the service clients built
//! from it.

use anyhow::{anyhow, Result};
use aws_config::{from_env, SdkConfig};
use aws_sdk_s3::config::Region;
use once_cell::sync::OnceCell;
use std::env;

/// Global AWS configuration.
static CURRENT: OnceCell<SdkConfig> = OnceCell::new();

/// Whether the endpoint was overridden, e.g. to use a local S3
/// replacement.
static CUSTOM_ENDPOINT: OnceCell<bool> = OnceCell::new();

/// Normalize an endpoint override into a URL.
fn endpoint_url(raw: String) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw
    } else {
        format!("https://{}", raw)
    }
}

/// Initialize the global AWS configuration.
pub async fn init() -> Result<()> {
    let endpoint_url_var = env::var("AWS_ENDPOINT_URL");
    let custom_endpoint = endpoint_url_var.is_ok();
    let config = if let Ok(endpoint) = endpoint_url_var {
        from_env()
            .endpoint_url(endpoint_url(endpoint))
            .region(Region::new("us-east-1")) // should be OK since the endpoint was overridden
            .load()
    } else {
        from_env().load()
    }
    .await;
    CUSTOM_ENDPOINT
        .set(custom_endpoint)
        .map_err(|_| anyhow!("client::CUSTOM_ENDPOINT was already initialized"))?;
    CURRENT
        .set(config)
        .map_err(|_| anyhow!("client::CURRENT was already initialized"))
}

/// Get the current AWS configuration, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static SdkConfig {
    CURRENT.get().expect("client is not initialized")
}

/// Build an S3 client. Overridden endpoints are addressed path-style.
pub fn s3() -> aws_sdk_s3::Client {
    let config = aws_sdk_s3::config::Builder::from(current())
        .force_path_style(CUSTOM_ENDPOINT.get().copied().unwrap_or(false))
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

pub fn sqs() -> aws_sdk_sqs::Client {
    aws_sdk_sqs::Client::new(current())
}

pub fn rekognition() -> aws_sdk_rekognition::Client {
    aws_sdk_rekognition::Client::new(current())
}
