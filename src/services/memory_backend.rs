//! In-process [`ObjectBackend`] for tests and local development.
//!
//! Behaves like S3 where the handlers care: ETags are the hex MD5 of the body,
//! Content-MD5 is verified on PUT, listings are lexicographic and paginated.

use crate::{
    models::object::RemoteObject,
    services::{
        cloud_backend::{CloudObject, ListPage, ObjectBackend},
        cloud_client::{CloudError, CloudResult, md5_base64},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

#[derive(Clone, Debug)]
struct Blob {
    body: Bytes,
    content_type: String,
    etag: String,
    last_modified: DateTime<Utc>,
}

pub struct InMemoryBackend {
    objects: Mutex<BTreeMap<(String, String), Blob>>,
    page_size: usize,
    put_failures: AtomicU32,
    put_attempts: AtomicU32,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_page_size(1000)
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listings return at most `page_size` keys per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
            put_failures: AtomicU32::new(0),
            put_attempts: AtomicU32::new(0),
        }
    }

    /// Make the next `count` PUTs fail with a transient error.
    pub fn fail_next_puts(&self, count: u32) {
        self.put_failures.store(count, Ordering::SeqCst);
    }

    /// PUT calls received so far, failed ones included.
    pub fn put_attempts(&self) -> u32 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Seed an object as if it had been uploaded at `last_modified`.
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        let body = body.into();
        let blob = Blob {
            etag: format!("{:x}", md5::compute(&body)),
            content_type: "application/octet-stream".into(),
            body,
            last_modified,
        };
        self.lock().insert((bucket.to_string(), key.to_string()), blob);
    }

    /// Every key currently in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn body(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|blob| blob.body.clone())
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|blob| blob.content_type.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), Blob>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn describe(key: &str, blob: &Blob) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            size_bytes: blob.body.len() as u64,
            etag: Some(blob.etag.clone()),
            last_modified: Some(blob.last_modified),
            content_type: Some(blob.content_type.clone()),
        }
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<Option<RemoteObject>> {
        Ok(self
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|blob| Self::describe(key, blob)))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Option<CloudObject>> {
        Ok(self
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|blob| CloudObject {
                meta: Self::describe(key, blob),
                body: blob.body.clone(),
            }))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        content_md5: &str,
    ) -> CloudResult<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .put_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CloudError::Backend {
                op: "PUT",
                key: key.to_string(),
                message: "503 SlowDown".into(),
            });
        }
        if md5_base64(&body) != content_md5 {
            return Err(CloudError::Backend {
                op: "PUT",
                key: key.to_string(),
                message: "BadDigest".into(),
            });
        }

        let blob = Blob {
            etag: format!("{:x}", md5::compute(&body)),
            content_type: content_type.to_string(),
            body,
            last_modified: Utc::now(),
        };
        self.lock().insert((bucket.to_string(), key.to_string()), blob);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> CloudResult<ListPage> {
        let objects = self.lock();
        let mut matching = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| continuation_token.as_ref().is_none_or(|after| k > after))
            .map(|((_, k), blob)| Self::describe(k, blob));

        let page: Vec<RemoteObject> = matching.by_ref().take(self.page_size).collect();
        let is_truncated = matching.next().is_some();
        let next_continuation_token = if is_truncated {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            is_truncated,
            next_continuation_token,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> CloudResult<()> {
        if keys.len() > 1000 {
            return Err(CloudError::InvalidRequest(format!(
                "{} keys in one delete request",
                keys.len()
            )));
        }
        let mut objects = self.lock();
        for key in keys {
            objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }
}
