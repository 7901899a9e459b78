//! `s3:delete` and `s3:rmdir`.

use crate::{models::receipts::DeleteReceipt, services::cloud_client::CloudClient};
use anyhow::Result;
use chrono::Utc;
use tracing::info;

pub async fn delete_object(cloud: &CloudClient, bucket: &str, path: &str) -> Result<DeleteReceipt> {
    cloud.delete(bucket, &[path.to_string()]).await?;
    info!(bucket = %bucket, path = %path, "deleted cloud object");
    Ok(DeleteReceipt {
        bucket: bucket.to_string(),
        path: path.to_string(),
        deleted_on: Utc::now(),
        deleted: 1,
    })
}

/// `foo/bar` becomes `foo/bar/` so a sibling such as `foo/barn` survives.
pub fn directory_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

pub async fn remove_directory(
    cloud: &CloudClient,
    bucket: &str,
    path: &str,
) -> Result<DeleteReceipt> {
    let prefix = directory_prefix(path);
    let deleted = cloud.remove_directory(bucket, &prefix).await?;
    info!(bucket = %bucket, prefix = %prefix, deleted, "removed cloud directory");
    Ok(DeleteReceipt {
        bucket: bucket.to_string(),
        path: prefix,
        deleted_on: Utc::now(),
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_backend::InMemoryBackend;
    use std::sync::Arc;

    #[test]
    fn prefix_gets_trailing_slash_once() {
        assert_eq!(directory_prefix("foo/bar"), "foo/bar/");
        assert_eq!(directory_prefix("foo/bar/"), "foo/bar/");
    }

    #[tokio::test]
    async fn rmdir_spares_sibling_prefixes() {
        let backend = Arc::new(InMemoryBackend::with_page_size(2));
        for key in ["foo/bar/a", "foo/bar/b", "foo/bar/c/d", "foo/barn/keep"] {
            backend.insert("B", key, &b"x"[..], Utc::now());
        }
        let cloud = CloudClient::new(backend.clone());

        let receipt = remove_directory(&cloud, "B", "foo/bar").await.unwrap();
        assert_eq!(receipt.path, "foo/bar/");
        assert_eq!(receipt.deleted, 3);
        assert_eq!(backend.keys("B"), vec!["foo/barn/keep"]);

        // Running it again is harmless.
        let again = remove_directory(&cloud, "B", "foo/bar").await.unwrap();
        assert_eq!(again.deleted, 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert("B", "x (1).txt", &b"x"[..], Utc::now());
        backend.insert("B", "x %281%29.txt", &b"x"[..], Utc::now());
        let cloud = CloudClient::new(backend.clone());

        let receipt = delete_object(&cloud, "B", "x (1).txt").await.unwrap();
        assert_eq!(receipt.path, "x (1).txt");
        delete_object(&cloud, "B", "x (1).txt").await.unwrap();
        assert_eq!(backend.keys("B"), vec!["x (1).txt"]);
    }
}
