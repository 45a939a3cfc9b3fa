//! Defines the classification capability: an opaque service that
//! labels image bytes.

use crate::error::InvocationError;
use async_trait::async_trait;
use aws_sdk_rekognition::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_rekognition::primitives::Blob;
use aws_sdk_rekognition::types::Image;
use aws_sdk_rekognition::Client;
use bytes::Bytes;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A label assigned to an image, with the confidence reported by the
/// capability (Rekognition reports percentages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    #[error("{0}")]
    Unavailable(String),

    /// The input is malformed or unsupported.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    AccessDenied(String),
}

impl From<ClassifyError> for InvocationError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Unavailable(reason) => InvocationError::ClassificationUnavailable(reason),
            ClassifyError::Rejected(reason) => InvocationError::ClassificationRejected(reason),
            ClassifyError::AccessDenied(reason) => InvocationError::GrantDenied(reason),
        }
    }
}

/// Labels images. Implementations are expected to tolerate abandoned
/// requests, since a timed-out call is not cancelled remotely.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: Bytes) -> Result<Vec<Label>, ClassifyError>;
}

/// Order labels by descending confidence, then by name, and drop
/// duplicate names keeping the most confident one.
pub fn normalize_labels(labels: impl IntoIterator<Item = Label>) -> Vec<Label> {
    labels
        .into_iter()
        .sorted_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        })
        .unique_by(|label| label.name.clone())
        .collect()
}

/// Classifier backed by Rekognition's DetectLabels.
#[derive(Debug, Clone)]
pub struct RekognitionClassifier {
    client: Client,
    max_labels: i32,
    min_confidence: f32,
}

impl RekognitionClassifier {
    pub fn new(client: Client, max_labels: i32, min_confidence: f32) -> Self {
        Self {
            client,
            max_labels,
            min_confidence,
        }
    }
}

/// Classify a Rekognition error by its error code.
fn rekognition_error<E>(err: SdkError<E>) -> ClassifyError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service) => {
            let message = format!("{}", service.err());
            match service.err().code() {
                Some("InvalidImageFormatException")
                | Some("ImageTooLargeException")
                | Some("InvalidParameterException")
                | Some("InvalidS3ObjectException") => ClassifyError::Rejected(message),
                Some("AccessDeniedException") => ClassifyError::AccessDenied(message),
                _ => ClassifyError::Unavailable(message),
            }
        }
        _ => ClassifyError::Unavailable(format!("{:?}", err)),
    }
}

#[async_trait]
impl Classifier for RekognitionClassifier {
    async fn classify(&self, image: Bytes) -> Result<Vec<Label>, ClassifyError> {
        let output = self
            .client
            .detect_labels()
            .image(Image::builder().bytes(Blob::new(image.to_vec())).build())
            .max_labels(self.max_labels)
            .min_confidence(self.min_confidence)
            .send()
            .await
            .map_err(rekognition_error)?;
        Ok(normalize_labels(
            output
                .labels()
                .unwrap_or_default()
                .iter()
                .filter_map(|label| {
                    Some(Label::new(
                        label.name()?,
                        label.confidence().unwrap_or_default(),
                    ))
                }),
        ))
    }
}
