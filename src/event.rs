//! Defines the notification events that trigger a classification,
//! and their construction from S3 event records. An S3 event may
//! carry several records; each creation record becomes exactly one
//! notification.

use aws_lambda_events::event::s3::{S3Event, S3EventRecord};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use tracing::{debug, instrument, warn};

/// Version tag used when a record carries neither a version id nor
/// an ETag, which is what S3 reports for unversioned buckets.
pub const NULL_VERSION: &str = "null";

/// A single object write, as observed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    /// The store's version id, if the bucket is versioned.
    pub version_id: Option<String>,
    pub etag: Option<String>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// The tag that identifies this write among other writes of the
    /// same key: the version id, falling back to the ETag.
    pub fn version_tag(&self) -> &str {
        self.version_id
            .as_deref()
            .or(self.etag.as_deref())
            .unwrap_or(NULL_VERSION)
    }

    /// The identity of the unit of work this write represents.
    pub fn identity(&self) -> ObjectVersion {
        ObjectVersion {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            version: self.version_tag().to_string(),
        }
    }
}

/// (bucket, key, version), the unit that gets at most one canonical
/// classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub bucket: String,
    pub key: String,
    pub version: String,
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}?version={}", self.bucket, self.key, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
}

/// A notification about one object write. The transport may deliver
/// the same notification more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub object: ObjectRecord,
    pub event_id: String,
    pub event_time: DateTime<Utc>,
}

impl NotificationEvent {
    /// Build a creation notification. The event id is derived from
    /// the object's identity and the store's sequencer, so that a
    /// redelivered record keeps its id.
    pub fn created(object: ObjectRecord, sequencer: Option<&str>, event_time: DateTime<Utc>) -> Self {
        let event_id = event_id(&object, sequencer);
        NotificationEvent {
            kind: EventKind::Created,
            object,
            event_id,
            event_time,
        }
    }

    /// Builds the notifications contained in an S3 event. Records
    /// other than object creations, and malformed records, are
    /// skipped.
    #[instrument(skip(event), fields(records = event.records.len()))]
    pub fn from_s3_event(event: &S3Event) -> Vec<Self> {
        event.records.iter().filter_map(Self::from_record).collect()
    }

    /// Builds the notification for a single S3 event record.
    pub fn from_record(record: &S3EventRecord) -> Option<Self> {
        let event_name = record.event_name.as_deref().unwrap_or_default();
        if !event_name.starts_with("ObjectCreated:") {
            debug!(event_name, "Ignoring non-creation S3 event record");
            return None;
        }
        let Some(bucket) = record.s3.bucket.name.as_deref() else {
            warn!("Ignoring S3 event record without a bucket name");
            return None;
        };
        let Some(raw_key) = record.s3.object.key.as_deref() else {
            warn!(bucket, "Ignoring S3 event record without an object key");
            return None;
        };
        let object = ObjectRecord {
            bucket: bucket.to_string(),
            key: decode_key(raw_key),
            version_id: record.s3.object.version_id.clone().filter(|v| !v.is_empty()),
            etag: record.s3.object.e_tag.clone().filter(|e| !e.is_empty()),
            size: record.s3.object.size.unwrap_or_default(),
            created_at: record.event_time,
        };
        Some(Self::created(
            object,
            record.s3.object.sequencer.as_deref(),
            record.event_time,
        ))
    }
}

/// Keys arrive form-urlencoded in S3 notifications: spaces are `+`
/// and everything else is percent-encoded.
pub fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Derive a stable event id from the object identity and sequencer.
fn event_id(object: &ObjectRecord, sequencer: Option<&str>) -> String {
    let mut hasher = Sha1::new();
    for part in [
        object.bucket.as_str(),
        object.key.as_str(),
        object.version_tag(),
        sequencer.unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    Base64UrlUnpadded::encode_string(&hasher.finalize())
}
