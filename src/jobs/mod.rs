//! Job handlers and the context they run in.
//!
//! Every handler is safe to run more than once: the queue delivers at least
//! once and retries failed attempts.

pub mod bulk_upload;
pub mod delete;
pub mod deploy_cleanup;
pub mod local_rmdir;
pub mod upload;

use crate::{
    models::job::Job,
    services::{cloud_client::CloudClient, deploy_repository::DeployRepository, local_store::LocalStore},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Where upload handlers read file content from.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Current bytes of `path`, or `None` when it no longer exists.
    async fn fetch(&self, path: &str) -> Result<Option<Bytes>>;
}

#[async_trait]
impl ContentSource for LocalStore {
    async fn fetch(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.read(path).await?)
    }
}

/// Collaborators shared by all handlers of one worker.
#[derive(Clone)]
pub struct JobContext {
    /// `None` when no bucket is configured; cloud jobs then fail.
    pub cloud: Option<CloudClient>,
    pub source: Arc<dyn ContentSource>,
    pub local: LocalStore,
    pub deploys: Arc<dyn DeployRepository>,
}

fn to_value<T: Serialize>(receipt: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(receipt)?)
}

impl JobContext {
    fn cloud(&self) -> Result<&CloudClient> {
        self.cloud
            .as_ref()
            .context("cloud job received but no bucket is configured")
    }

    /// Run one job and return its receipt as JSON.
    pub async fn execute(&self, job: &Job) -> Result<serde_json::Value> {
        match job {
            Job::FileRemoveDirectory { path } => {
                to_value(local_rmdir::remove_local_directory(&self.local, path).await?)
            }
            Job::DeployCleanup { age_in_days } => to_value(
                deploy_cleanup::sweep_expired_deploys(self.deploys.as_ref(), *age_in_days).await?,
            ),
            Job::S3RemoveDirectory { path, bucket } => {
                to_value(delete::remove_directory(self.cloud()?, bucket, path).await?)
            }
            Job::S3Delete { path, bucket } => {
                to_value(delete::delete_object(self.cloud()?, bucket, path).await?)
            }
            Job::S3Upload { path, bucket } => to_value(
                upload::upload_object(self.cloud()?, self.source.as_ref(), bucket, path).await?,
            ),
            Job::S3UploadBulk {
                paths,
                bucket,
                concurrency,
                shuffle,
            } => to_value(
                bulk_upload::upload_bulk(
                    self.cloud()?,
                    self.source.as_ref(),
                    bucket,
                    paths.clone(),
                    concurrency.unwrap_or(bulk_upload::DEFAULT_CONCURRENCY),
                    shuffle.unwrap_or(false),
                )
                .await?,
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn execute_dispatches_and_returns_receipt() {
        let h = harness().await;
        h.ctx
            .local
            .write("foo/bar/readme.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let receipt = h
            .ctx
            .execute(&Job::upload("foo/bar/readme.txt", "B"))
            .await
            .unwrap();
        assert_eq!(receipt["bucket"], json!("B"));
        assert_eq!(receipt["path"], json!("foo/bar/readme.txt"));
        assert_eq!(receipt["status"], json!("uploaded"));
        assert!(receipt["uploadedOn"].is_string());
        assert_eq!(h.backend.keys("B"), vec!["foo/bar/readme.txt"]);
    }

    #[tokio::test]
    async fn cloud_jobs_fail_without_a_bucket() {
        let mut h = harness().await;
        h.ctx.cloud = None;
        assert!(h.ctx.execute(&Job::delete("a", "B")).await.is_err());
        // Local-only jobs still run.
        h.ctx
            .execute(&Job::FileRemoveDirectory { path: "nothing".into() })
            .await
            .unwrap();
    }
}
