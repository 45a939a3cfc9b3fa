//! Defines the object store seam: fetching the exact bytes of an
//! object write, and the S3 and in-memory backends behind it.

use crate::event::{NotificationEvent, ObjectRecord, NULL_VERSION};
use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use base64ct::{Base64, Encoding};
use bytes::Bytes;
use chrono::Utc;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The requested version doesn't exist (anymore).
    #[error("object {key:?} version {version:?} not found in bucket {bucket:?}")]
    NotFound {
        bucket: String,
        key: String,
        version: String,
    },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn not_found(object: &ObjectRecord) -> Self {
        StoreError::NotFound {
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            version: object.version_tag().to_string(),
        }
    }
}

/// Durable, versioned blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, returning the version that was created.
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<String, StoreError>;

    /// Fetch the bytes of exactly the write described by `object`.
    async fn get(&self, object: &ObjectRecord) -> Result<Bytes, StoreError>;
}

/// S3-backed object store.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Classify an S3 error by its error code.
fn s3_error<E>(object: &ObjectRecord, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service) => match service.err().code() {
            Some("NoSuchKey") | Some("NoSuchVersion") | Some("PreconditionFailed") => {
                StoreError::not_found(object)
            }
            // Without s3:ListBucket a missing key is also reported
            // as AccessDenied.
            Some("AccessDenied") => StoreError::AccessDenied(format!(
                "Failed to read object {:?} from bucket {:?}: {}",
                object.key,
                object.bucket,
                service.err()
            )),
            _ => StoreError::Unavailable(format!("{}", service.err())),
        },
        _ => StoreError::Unavailable(format!("{:?}", err)),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<String, StoreError> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "Failed to upload object {:?} to bucket {:?}: {:?}",
                    key, bucket, e
                ))
            })?;
        Ok(output
            .version_id()
            .or(output.e_tag())
            .unwrap_or(NULL_VERSION)
            .to_string())
    }

    async fn get(&self, object: &ObjectRecord) -> Result<Bytes, StoreError> {
        let mut request = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key);
        if let Some(version_id) = &object.version_id {
            request = request.version_id(version_id);
        } else if let Some(etag) = &object.etag {
            // Unversioned bucket: an overwritten object no longer
            // matches the ETag of the write that was notified.
            request = request.if_match(etag);
        }
        let output = request.send().await.map_err(|e| s3_error(object, e))?;
        let data = output.body.collect().await.map_err(|e| {
            StoreError::Unavailable(format!(
                "Failed to read the contents of object {:?} from bucket {:?}: {}",
                object.key, object.bucket, e
            ))
        })?;
        Ok(data.into_bytes())
    }
}

/// Content hash as reported in ETags and result digests.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    Base64::encode_string(&hasher.finalize())
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    etag: String,
    bytes: Bytes,
}

/// In-memory versioned store. Every completed `put` is announced to
/// the current subscribers as a creation notification.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: RwLock<HashMap<(String, String), Vec<StoredVersion>>>,
    subscribers: Mutex<Vec<UnboundedSender<NotificationEvent>>>,
    sequence: AtomicUsize,
    gets: AtomicUsize,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable(String::from("object store lock poisoned"))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a notification for every subsequent write.
    pub fn subscribe(&self) -> UnboundedReceiver<NotificationEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Remove a single version, as if it was deleted before it could
    /// be processed.
    pub fn delete_version(&self, bucket: &str, key: &str, version_id: &str) -> bool {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        match objects.get_mut(&(bucket.to_string(), key.to_string())) {
            Some(versions) => {
                let before = versions.len();
                versions.retain(|v| v.version_id != version_id);
                before != versions.len()
            }
            None => false,
        }
    }

    /// How many fetches were served, successful or not.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn notify(&self, event: NotificationEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<String, StoreError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let version = StoredVersion {
            version_id: format!("v{sequence}"),
            etag: content_digest(&bytes),
            bytes,
        };
        let record = ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id: Some(version.version_id.clone()),
            etag: Some(version.etag.clone()),
            size: version.bytes.len() as i64,
            created_at: Utc::now(),
        };
        self.objects
            .write()
            .map_err(poison_err)?
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .push(version);
        debug!(bucket, key, version = record.version_tag(), "Stored object");
        let event = NotificationEvent::created(
            record.clone(),
            Some(&format!("{sequence:016X}")),
            record.created_at,
        );
        self.notify(event);
        Ok(record.version_tag().to_string())
    }

    async fn get(&self, object: &ObjectRecord) -> Result<Bytes, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.read().map_err(poison_err)?;
        let versions = objects
            .get(&(object.bucket.clone(), object.key.clone()))
            .ok_or_else(|| StoreError::not_found(object))?;
        let found = match (&object.version_id, &object.etag) {
            (Some(version_id), _) => versions.iter().find(|v| &v.version_id == version_id),
            (None, Some(etag)) => versions.last().filter(|v| &v.etag == etag),
            (None, None) => versions.last(),
        };
        match found {
            Some(version) => Ok(version.bytes.clone()),
            None => {
                warn!(
                    bucket = %object.bucket,
                    key = %object.key,
                    version = object.version_tag(),
                    "Requested object version is gone"
                );
                Err(StoreError::not_found(object))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_notifies_and_get_returns_exact_version() {
        let store = InMemoryStore::new();
        let mut notifications = store.subscribe();

        let v1 = store
            .put("images", "cat.jpg", Bytes::from_static(b"first"))
            .await
            .unwrap();
        let v2 = store
            .put("images", "cat.jpg", Bytes::from_static(b"second"))
            .await
            .unwrap();
        assert_ne!(v1, v2);

        let first = notifications.recv().await.unwrap();
        let second = notifications.recv().await.unwrap();
        assert_eq!(first.object.version_tag(), v1);
        assert_eq!(second.object.version_tag(), v2);
        assert_ne!(first.event_id, second.event_id);

        assert_eq!(store.get(&first.object).await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(store.get(&second.object).await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(store.get_count(), 2);
    }

    #[tokio::test]
    async fn deleted_version_is_not_found() {
        let store = InMemoryStore::new();
        let mut notifications = store.subscribe();
        let version = store
            .put("images", "gone.jpg", Bytes::from_static(b"bytes"))
            .await
            .unwrap();
        let event = notifications.recv().await.unwrap();
        assert!(store.delete_version("images", "gone.jpg", &version));

        let err = store.get(&event.object).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn overwritten_unversioned_object_is_not_found() {
        let store = InMemoryStore::new();
        let mut notifications = store.subscribe();
        store
            .put("images", "a.jpg", Bytes::from_static(b"old"))
            .await
            .unwrap();
        store
            .put("images", "a.jpg", Bytes::from_static(b"new"))
            .await
            .unwrap();
        let mut old = notifications.recv().await.unwrap().object;
        old.version_id = None;

        let err = store.get(&old).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(content_digest(b"abc"), content_digest(b"abc"));
        assert_ne!(content_digest(b"abc"), content_digest(b"abd"));
    }
}
