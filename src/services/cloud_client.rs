//! Cloud tier client: key encoding, PUT retries, pagination and recursive
//! prefix removal on top of an [`ObjectBackend`].

use crate::{
    models::{object::RemoteObject, stats::CloudStats},
    services::cloud_backend::{CloudObject, ListPage, ObjectBackend},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{op} `{key}` failed: {message}")]
    Backend {
        op: &'static str,
        key: String,
        message: String,
    },
    #[error("malformed listing response: {0}")]
    MalformedResponse(String),
    #[error("PUT `{key}` failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        message: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Largest batch a single DeleteObjects request accepts.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Linear backoff for PUT: the wait before attempt `n + 1` is `step * n`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempts: u32) -> Duration {
        self.backoff_step * attempts
    }
}

/// Percent-encode parentheses, which the request signer mishandles.
pub fn encode_key(path: &str) -> String {
    path.replace('(', "%28").replace(')', "%29")
}

/// Inverse of [`encode_key`], for comparing listed keys with local paths.
pub fn decode_key(key: &str) -> String {
    key.replace("%28", "(").replace("%29", ")")
}

/// Base64 of the MD5 digest, as sent in `Content-MD5`.
pub fn md5_base64(data: &[u8]) -> String {
    B64.encode(md5::compute(data).0)
}

#[derive(Clone)]
pub struct CloudClient {
    backend: Arc<dyn ObjectBackend>,
    retry: RetryPolicy,
}

impl CloudClient {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Existence and metadata probe. A missing key is `Ok(None)`.
    pub async fn head(&self, bucket: &str, path: &str) -> CloudResult<Option<RemoteObject>> {
        self.backend.head_object(bucket, &encode_key(path)).await
    }

    /// Fetch an object. A missing key is `Ok(None)`.
    pub async fn get(&self, bucket: &str, path: &str) -> CloudResult<Option<CloudObject>> {
        self.backend.get_object(bucket, &encode_key(path)).await
    }

    /// Write an object with its Content-MD5, retrying transient failures.
    pub async fn put(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
        content_type: &str,
    ) -> CloudResult<()> {
        let key = encode_key(path);
        let checksum = md5_base64(&body);
        let size_bytes = body.len();
        let start = std::time::Instant::now();

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .backend
                .put_object(bucket, &key, body.clone(), content_type, &checksum)
                .await
            {
                Ok(()) => {
                    info!(
                        bucket = %bucket,
                        key = %key,
                        size_bytes,
                        attempts,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "cloud upload successful"
                    );
                    return Ok(());
                }
                Err(err) if attempts < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempts);
                    warn!(
                        bucket = %bucket,
                        key = %key,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "cloud upload failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(CloudError::RetriesExhausted {
                        key,
                        attempts,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// A single listing page under `prefix`.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> CloudResult<ListPage> {
        self.backend
            .list_objects(bucket, &encode_key(prefix), continuation_token)
            .await
    }

    /// Walk every page under `prefix`, handing each to `visit`.
    async fn for_each_page<F>(&self, bucket: &str, prefix: &str, mut visit: F) -> CloudResult<()>
    where
        F: FnMut(ListPage),
    {
        let mut token = None;
        loop {
            let page = self.list(bucket, prefix, token).await?;
            let next = if page.is_truncated {
                Some(page.next_continuation_token.clone().ok_or_else(|| {
                    CloudError::MalformedResponse(format!(
                        "truncated listing under `{}` without continuation token",
                        prefix
                    ))
                })?)
            } else {
                None
            };
            visit(page);
            match next {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Every object under `prefix`, across all pages.
    pub async fn list_all(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        self.for_each_page(bucket, prefix, |page| objects.extend(page.objects))
            .await?;
        Ok(objects)
    }

    /// Decoded keys under `prefix`, sorted.
    pub async fn list_all_keys(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .list_all(bucket, prefix)
            .await?
            .into_iter()
            .map(|o| decode_key(&o.key))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Object count and byte total for the whole bucket.
    pub async fn stats(&self, bucket: &str) -> CloudResult<CloudStats> {
        let mut stats = CloudStats {
            bucket: bucket.to_string(),
            count: 0,
            bytes: 0,
        };
        self.for_each_page(bucket, "", |page| {
            stats.count += page.objects.len() as u64;
            stats.bytes += page.objects.iter().map(|o| o.size_bytes).sum::<u64>();
        })
        .await?;
        Ok(stats)
    }

    /// Delete the given paths in batches.
    pub async fn delete(&self, bucket: &str, paths: &[String]) -> CloudResult<()> {
        let keys: Vec<String> = paths.iter().map(|p| encode_key(p)).collect();
        self.delete_keys(bucket, &keys).await
    }

    async fn delete_keys(&self, bucket: &str, keys: &[String]) -> CloudResult<()> {
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            self.backend.delete_objects(bucket, batch).await?;
        }
        Ok(())
    }

    /// Remove every object under `prefix`.
    ///
    /// Lists the first page, deletes it, and repeats while the listing was
    /// truncated. Iterative so arbitrarily large prefixes use constant stack.
    /// Returns the number of objects deleted.
    pub async fn remove_directory(&self, bucket: &str, prefix: &str) -> CloudResult<u64> {
        let mut deleted = 0u64;
        loop {
            let page = self.list(bucket, prefix, None).await?;
            if page.objects.is_empty() {
                break;
            }
            let keys: Vec<String> = page.objects.into_iter().map(|o| o.key).collect();
            self.delete_keys(bucket, &keys).await?;
            deleted += keys.len() as u64;
            debug!(bucket = %bucket, prefix = %prefix, batch = keys.len(), "deleted batch");
            if !page.is_truncated {
                break;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_backend::InMemoryBackend;
    use chrono::Utc;

    fn client(backend: &Arc<InMemoryBackend>) -> CloudClient {
        CloudClient::new(backend.clone()).with_retry(RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::ZERO,
        })
    }

    #[test]
    fn parentheses_are_percent_encoded() {
        assert_eq!(encode_key("games/a (1)/x.js"), "games/a %281%29/x.js");
        assert_eq!(decode_key("games/a %281%29/x.js"), "games/a (1)/x.js");
        assert_eq!(md5_base64(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_step: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn put_stores_under_encoded_key() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = client(&backend);
        client
            .put("B", "a(1).txt", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        assert_eq!(backend.keys("B"), vec!["a%281%29.txt"]);
        assert!(client.head("B", "a(1).txt").await.unwrap().is_some());
        assert!(client.head("B", "other.txt").await.unwrap().is_none());
        assert!(client.get("B", "other.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_retries_transient_failures() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_next_puts(2);
        client(&backend)
            .put("B", "k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        assert_eq!(backend.put_attempts(), 3);
        assert_eq!(backend.body("B", "k").as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn put_gives_up_after_budget() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_next_puts(10);
        let err = client(&backend)
            .put("B", "k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(backend.put_attempts(), 3);
    }

    #[tokio::test]
    async fn list_all_follows_continuation_tokens() {
        let backend = Arc::new(InMemoryBackend::with_page_size(2));
        for i in 0..5 {
            backend.insert("B", &format!("p/{i}"), vec![0u8; i + 1], Utc::now());
        }
        backend.insert("B", "q/outside", b"x".to_vec(), Utc::now());

        let client = client(&backend);
        let keys = client.list_all_keys("B", "p/").await.unwrap();
        assert_eq!(keys, vec!["p/0", "p/1", "p/2", "p/3", "p/4"]);

        let stats = client.stats("B").await.unwrap();
        assert_eq!(stats.count, 6);
        assert_eq!(stats.bytes, 1 + 2 + 3 + 4 + 5 + 1);
    }

    #[tokio::test]
    async fn remove_directory_repeats_until_prefix_is_empty() {
        let backend = Arc::new(InMemoryBackend::with_page_size(3));
        for i in 0..10 {
            backend.insert("B", &format!("deploy/{i:02}"), b"x".to_vec(), Utc::now());
        }
        backend.insert("B", "deployment/keep", b"x".to_vec(), Utc::now());

        let deleted = client(&backend)
            .remove_directory("B", "deploy/")
            .await
            .unwrap();
        assert_eq!(deleted, 10);
        assert_eq!(backend.keys("B"), vec!["deployment/keep"]);
    }

    /// Lists one object and claims more follow, but hands out no token.
    struct TokenlessBackend;

    #[async_trait::async_trait]
    impl ObjectBackend for TokenlessBackend {
        async fn head_object(&self, _: &str, _: &str) -> CloudResult<Option<RemoteObject>> {
            Ok(None)
        }

        async fn get_object(&self, _: &str, _: &str) -> CloudResult<Option<CloudObject>> {
            Ok(None)
        }

        async fn put_object(&self, _: &str, _: &str, _: Bytes, _: &str, _: &str) -> CloudResult<()> {
            Ok(())
        }

        async fn list_objects(
            &self,
            _: &str,
            prefix: &str,
            _: Option<String>,
        ) -> CloudResult<ListPage> {
            Ok(ListPage {
                objects: vec![RemoteObject {
                    key: format!("{prefix}a"),
                    size_bytes: 1,
                    etag: None,
                    last_modified: None,
                    content_type: None,
                }],
                is_truncated: true,
                next_continuation_token: None,
            })
        }

        async fn delete_objects(&self, _: &str, _: &[String]) -> CloudResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn truncated_listing_without_token_is_malformed() {
        let client = CloudClient::new(Arc::new(TokenlessBackend));
        assert!(matches!(
            client.list_all("B", "p/").await,
            Err(CloudError::MalformedResponse(_))
        ));
        assert!(matches!(
            client.list_all_keys("B", "p/").await,
            Err(CloudError::MalformedResponse(_))
        ));
        assert!(matches!(
            client.stats("B").await,
            Err(CloudError::MalformedResponse(_))
        ));
    }
}
