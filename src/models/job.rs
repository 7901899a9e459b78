//! Background jobs exchanged between the file server and workers.
//!
//! Jobs travel through the queue as flat JSON objects discriminated by a
//! literal `name` field, e.g. `{"name":"s3:upload","path":"a/b.txt","bucket":"B"}`.
//! Every variant is self-contained so a worker on another host can execute it,
//! and every handler tolerates being run more than once.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "name")]
pub enum Job {
    /// Remove a directory tree from the local root.
    #[serde(rename = "file:rmdir")]
    FileRemoveDirectory { path: String },

    /// Sweep expired, unpinned deploys.
    #[serde(rename = "deploy:cleanup")]
    DeployCleanup {
        #[serde(
            rename = "ageInDays",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        age_in_days: Option<u32>,
    },

    /// Remove every object under a prefix in the bucket.
    #[serde(rename = "s3:rmdir")]
    S3RemoveDirectory { path: String, bucket: String },

    /// Remove a single object from the bucket.
    #[serde(rename = "s3:delete")]
    S3Delete { path: String, bucket: String },

    /// Replicate one local file to the bucket.
    #[serde(rename = "s3:upload")]
    S3Upload { path: String, bucket: String },

    /// Replicate a batch of local files to the bucket.
    #[serde(rename = "s3:upload:bulk")]
    S3UploadBulk {
        paths: Vec<String>,
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrency: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shuffle: Option<bool>,
    },
}

impl Job {
    /// The wire discriminator, also stored in its own queue column.
    pub fn name(&self) -> &'static str {
        match self {
            Job::FileRemoveDirectory { .. } => "file:rmdir",
            Job::DeployCleanup { .. } => "deploy:cleanup",
            Job::S3RemoveDirectory { .. } => "s3:rmdir",
            Job::S3Delete { .. } => "s3:delete",
            Job::S3Upload { .. } => "s3:upload",
            Job::S3UploadBulk { .. } => "s3:upload:bulk",
        }
    }

    pub fn upload(path: impl Into<String>, bucket: impl Into<String>) -> Self {
        Job::S3Upload {
            path: path.into(),
            bucket: bucket.into(),
        }
    }

    pub fn delete(path: impl Into<String>, bucket: impl Into<String>) -> Self {
        Job::S3Delete {
            path: path.into(),
            bucket: bucket.into(),
        }
    }

    pub fn remove_directory(path: impl Into<String>, bucket: impl Into<String>) -> Self {
        Job::S3RemoveDirectory {
            path: path.into(),
            bucket: bucket.into(),
        }
    }

    pub fn upload_bulk(paths: Vec<String>, bucket: impl Into<String>) -> Self {
        Job::S3UploadBulk {
            paths,
            bucket: bucket.into(),
            concurrency: None,
            shuffle: None,
        }
    }
}
