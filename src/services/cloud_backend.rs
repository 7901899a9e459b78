//! Object-storage primitives behind [`CloudClient`](super::cloud_client::CloudClient).
//!
//! The trait is deliberately raw: keys arrive already encoded and no call is
//! retried here. `S3Backend` talks to S3 (or any S3-compatible endpoint) via
//! `aws-sdk-s3`; tests use the in-memory backend.

use crate::{
    config::CloudConfig,
    models::object::{RemoteObject, unquote_etag},
    services::cloud_client::{CloudError, CloudResult},
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// An object body together with its metadata.
#[derive(Clone, Debug)]
pub struct CloudObject {
    pub meta: RemoteObject,
    pub body: Bytes,
}

/// One page of a prefix listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObject>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Metadata probe; `None` when the key does not exist.
    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<Option<RemoteObject>>;

    /// Fetch a body; `None` when the key does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Option<CloudObject>>;

    /// Single-shot PUT with content type and base64 Content-MD5.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        content_md5: &str,
    ) -> CloudResult<()>;

    /// One ListObjectsV2 page.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> CloudResult<ListPage>;

    /// Batched delete of at most 1000 keys.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> CloudResult<()>;
}

/// `ObjectBackend` implementation using the AWS SDK for Rust.
#[derive(Clone, Debug)]
pub struct S3Backend {
    client: Client,
}

impl S3Backend {
    /// Build a client from the configured region, optional endpoint and
    /// optional static credentials (default provider chain otherwise).
    pub async fn from_config(cfg: &CloudConfig) -> Self {
        let loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));

        let loader = match (&cfg.access_key_id, &cfg.secret_access_key) {
            (Some(key_id), Some(secret)) => loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "deploy-store",
            )),
            _ => loader,
        };

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    /// Wrap an existing SDK client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    dt.to_millis().ok().and_then(DateTime::from_timestamp_millis)
}

fn sdk_error(op: &'static str, key: &str, err: impl std::error::Error) -> CloudError {
    CloudError::Backend {
        op,
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<Option<RemoteObject>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(RemoteObject {
                key: key.to_string(),
                size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(unquote_etag),
                last_modified: output.last_modified().and_then(to_chrono),
                content_type: output.content_type().map(str::to_string),
            })),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(sdk_error("HEAD", key, service_err))
                }
            }
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Option<CloudObject>> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(sdk_error("GET", key, service_err));
            }
        };

        let meta = RemoteObject {
            key: key.to_string(),
            size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().map(unquote_etag),
            last_modified: output.last_modified().and_then(to_chrono),
            content_type: output.content_type().map(str::to_string),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| sdk_error("GET", key, err))?
            .into_bytes();

        Ok(Some(CloudObject { meta, body }))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        content_md5: &str,
    ) -> CloudResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .content_md5(content_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error("PUT", key, err))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> CloudResult<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|err| sdk_error("LIST", prefix, err))?;

        let objects = output
            .contents()
            .iter()
            .map(|obj| {
                let key = obj.key().ok_or_else(|| {
                    CloudError::MalformedResponse(format!("entry without key under `{}`", prefix))
                })?;
                Ok(RemoteObject {
                    key: key.to_string(),
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    etag: obj.e_tag().map(unquote_etag),
                    last_modified: obj.last_modified().and_then(to_chrono),
                    content_type: None,
                })
            })
            .collect::<CloudResult<Vec<_>>>()?;

        Ok(ListPage {
            objects,
            is_truncated: output.is_truncated().unwrap_or(false),
            next_continuation_token: output.next_continuation_token().map(str::to_string),
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> CloudResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| CloudError::InvalidRequest(err.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| CloudError::InvalidRequest(err.to_string()))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| sdk_error("DELETE", &keys[0], err))?;

        if let Some(failed) = output.errors().first() {
            return Err(CloudError::Backend {
                op: "DELETE",
                key: failed.key().unwrap_or_default().to_string(),
                message: failed.message().unwrap_or("delete rejected").to_string(),
            });
        }
        Ok(())
    }
}
