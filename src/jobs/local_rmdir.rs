//! `file:rmdir`: reclaim local disk space for a directory.

use crate::{models::receipts::CleanupReceipt, services::local_store::LocalStore};
use anyhow::Result;
use chrono::Utc;
use tracing::info;

pub async fn remove_local_directory(local: &LocalStore, path: &str) -> Result<CleanupReceipt> {
    let removed = local.remove_dir(path).await?;
    info!(path = %path, removed, "removed local directory");
    Ok(CleanupReceipt {
        path: path.to_string(),
        cleaned_on: Utc::now(),
    })
}
