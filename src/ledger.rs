//! Defines how redelivered work is kept from producing divergent
//! results for the same object version.

use crate::event::ObjectVersion;
use crate::processor::ClassificationResult;
use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How idempotency of redelivered invocations is achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyMode {
    /// Trust the classifier to return the same labels for the same
    /// bytes, and classify again on redelivery.
    Deterministic,

    /// Keep the first result per object version as canonical, and
    /// answer redeliveries from it without fetching or classifying.
    #[default]
    Ledger,
}

/// A record of canonical results.
#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Find the canonical result for an object version.
    async fn lookup(&self, object: &ObjectVersion) -> Option<ClassificationResult>;

    /// Offer a result. The first result recorded for an object
    /// version stays canonical, and is what's returned.
    async fn record(&self, result: ClassificationResult) -> ClassificationResult;
}

/// Pick the canonical result between a recorded one and a new
/// candidate, flagging a classifier that isn't deterministic.
fn canonical(recorded: ClassificationResult, candidate: &ClassificationResult) -> ClassificationResult {
    if recorded.content_digest == candidate.content_digest && recorded.labels != candidate.labels {
        warn!(
            object = %candidate.object,
            "Classifier returned different labels for identical bytes; \
             keeping the first result"
        );
    }
    recorded
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    results: RwLock<HashMap<ObjectVersion, ClassificationResult>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ResultLedger for InMemoryLedger {
    async fn lookup(&self, object: &ObjectVersion) -> Option<ClassificationResult> {
        self.results.read().await.get(object).cloned()
    }

    async fn record(&self, result: ClassificationResult) -> ClassificationResult {
        let mut results = self.results.write().await;
        match results.get(&result.object) {
            Some(recorded) => canonical(recorded.clone(), &result),
            None => {
                results.insert(result.object.clone(), result.clone());
                result
            }
        }
    }
}

/// The key of the marker object holding the result of `object`.
pub fn marker_key(prefix: &str, object: &ObjectVersion) -> String {
    format!(
        "{}{}/{}/{}.json",
        prefix, object.bucket, object.key, object.version
    )
}

/// Ledger kept as one JSON marker object per object version in an
/// S3 bucket, shared by every process that points at it.
///
/// The bucket should not be one the bridge is notified about, or
/// `MATCH_KEY` should exclude the markers.
#[derive(Debug, Clone)]
pub struct S3Ledger {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Ledger {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ResultLedger for S3Ledger {
    /// A marker that can't be read counts as missing: the object is
    /// classified again and the marker rewritten.
    async fn lookup(&self, object: &ObjectVersion) -> Option<ClassificationResult> {
        let key = marker_key(&self.prefix, object);
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.err().code() == Some("NoSuchKey") => {
                debug!(marker = %key, "No recorded result");
                return None;
            }
            Err(e) => {
                warn!(marker = %key, "Couldn't read result marker: {:?}", e);
                return None;
            }
        };
        let data = match output.body.collect().await {
            Ok(data) => data.into_bytes(),
            Err(e) => {
                warn!(marker = %key, "Couldn't read result marker contents: {:?}", e);
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(marker = %key, "Result marker is not a valid result: {:?}", e);
                None
            }
        }
    }

    async fn record(&self, result: ClassificationResult) -> ClassificationResult {
        // Two writers racing past this lookup both write; the last
        // marker then wins.
        if let Some(recorded) = self.lookup(&result.object).await {
            return canonical(recorded, &result);
        }
        let key = marker_key(&self.prefix, &result.object);
        let body = match serde_json::to_vec(&result) {
            Ok(body) => body,
            Err(e) => {
                warn!(marker = %key, "Couldn't serialize result: {:?}", e);
                return result;
            }
        };
        if let Err(e) = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
        {
            warn!(marker = %key, "Couldn't write result marker: {:?}", e);
        }
        result
    }
}
