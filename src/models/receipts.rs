//! Results returned by job handlers and stored with the completed job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single upload was resolved.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Freshly written to the bucket.
    Uploaded,
    /// Remote copy already matched the local content.
    Unmodified,
    /// The local file was gone when the job ran.
    Missing,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub bucket: String,
    pub path: String,
    pub status: UploadStatus,
    /// Time of our PUT, or the remote Last-Modified for an unmodified object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_on: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkUploadReceipt {
    pub bucket: String,
    pub uploaded: Vec<String>,
    pub unmodified: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReceipt {
    pub bucket: String,
    pub path: String,
    pub deleted_on: DateTime<Utc>,
    /// Objects removed; always 1 for a single-key delete.
    #[serde(default)]
    pub deleted: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReceipt {
    pub path: String,
    pub cleaned_on: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploySweepReceipt {
    pub deleted: u64,
    pub cleaned_on: DateTime<Utc>,
}
