//! `s3:upload`: replicate one local file, skipping the PUT when the bucket
//! already holds identical content.

use super::ContentSource;
use crate::{
    models::{
        object::content_type_for,
        receipts::{UploadReceipt, UploadStatus},
    },
    services::cloud_client::CloudClient,
};
use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

pub async fn upload_object(
    cloud: &CloudClient,
    source: &dyn ContentSource,
    bucket: &str,
    path: &str,
) -> Result<UploadReceipt> {
    let remote = cloud.head(bucket, path).await?;

    let Some(content) = source.fetch(path).await? else {
        debug!(bucket = %bucket, path = %path, "local file gone, nothing to upload");
        return Ok(UploadReceipt {
            bucket: bucket.to_string(),
            path: path.to_string(),
            status: UploadStatus::Missing,
            uploaded_on: None,
        });
    };

    if let Some(remote) = remote {
        let digest = format!("{:x}", md5::compute(&content));
        if remote.matches(&digest, content.len() as u64) {
            debug!(bucket = %bucket, path = %path, "remote copy up to date");
            return Ok(UploadReceipt {
                bucket: bucket.to_string(),
                path: path.to_string(),
                status: UploadStatus::Unmodified,
                uploaded_on: remote.last_modified,
            });
        }
        // The local tier is authoritative.
        warn!(
            bucket = %bucket,
            path = %path,
            remote_etag = remote.etag.as_deref().unwrap_or(""),
            remote_size = remote.size_bytes,
            local_etag = %digest,
            local_size = content.len(),
            "remote copy differs from local content, overwriting"
        );
    }

    cloud
        .put(bucket, path, content, content_type_for(path))
        .await?;
    Ok(UploadReceipt {
        bucket: bucket.to_string(),
        path: path.to_string(),
        status: UploadStatus::Uploaded,
        uploaded_on: Some(Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::harness;
    use bytes::Bytes;
    use chrono::TimeZone;

    #[tokio::test]
    async fn uploads_when_absent() {
        let h = harness().await;
        h.ctx
            .local
            .write("site/index.html", Bytes::from_static(b"<h1>hi</h1>"))
            .await
            .unwrap();
        let cloud = h.ctx.cloud.as_ref().unwrap();

        let receipt = upload_object(cloud, h.ctx.source.as_ref(), "B", "site/index.html")
            .await
            .unwrap();
        assert_eq!(receipt.status, UploadStatus::Uploaded);
        assert_eq!(
            h.backend.body("B", "site/index.html").as_deref(),
            Some(&b"<h1>hi</h1>"[..])
        );
        assert_eq!(
            h.backend.content_type("B", "site/index.html").as_deref(),
            Some("text/html; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn matching_remote_is_not_uploaded_again() {
        let h = harness().await;
        h.ctx
            .local
            .write("a.txt", Bytes::from_static(b"same"))
            .await
            .unwrap();
        let remote_time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        h.backend.insert("B", "a.txt", &b"same"[..], remote_time);

        let cloud = h.ctx.cloud.as_ref().unwrap();
        let receipt = upload_object(cloud, h.ctx.source.as_ref(), "B", "a.txt")
            .await
            .unwrap();
        assert_eq!(receipt.status, UploadStatus::Unmodified);
        assert_eq!(receipt.uploaded_on, Some(remote_time));
        assert_eq!(h.backend.put_attempts(), 0);
    }

    #[tokio::test]
    async fn differing_remote_is_overwritten() {
        let h = harness().await;
        h.ctx
            .local
            .write("a.txt", Bytes::from_static(b"new"))
            .await
            .unwrap();
        h.backend.insert("B", "a.txt", &b"old"[..], Utc::now());

        let cloud = h.ctx.cloud.as_ref().unwrap();
        let receipt = upload_object(cloud, h.ctx.source.as_ref(), "B", "a.txt")
            .await
            .unwrap();
        assert_eq!(receipt.status, UploadStatus::Uploaded);
        assert_eq!(h.backend.body("B", "a.txt").as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn missing_local_file_is_reported() {
        let h = harness().await;
        let cloud = h.ctx.cloud.as_ref().unwrap();
        let receipt = upload_object(cloud, h.ctx.source.as_ref(), "B", "gone.txt")
            .await
            .unwrap();
        assert_eq!(receipt.status, UploadStatus::Missing);
        assert!(h.backend.keys("B").is_empty());
    }

    #[tokio::test]
    async fn parenthesised_paths_round_trip_through_encoding() {
        let h = harness().await;
        h.ctx
            .local
            .write("game (1)/main.js", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let cloud = h.ctx.cloud.as_ref().unwrap();

        let first = upload_object(cloud, h.ctx.source.as_ref(), "B", "game (1)/main.js")
            .await
            .unwrap();
        let second = upload_object(cloud, h.ctx.source.as_ref(), "B", "game (1)/main.js")
            .await
            .unwrap();
        assert_eq!(first.status, UploadStatus::Uploaded);
        assert_eq!(second.status, UploadStatus::Unmodified);
        assert_eq!(h.backend.keys("B"), vec!["game %281%29/main.js"]);
    }
}
