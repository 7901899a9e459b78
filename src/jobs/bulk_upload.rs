//! `s3:upload:bulk`: replicate a batch of files, typically one extracted
//! deploy archive.
//!
//! Paths are split into `concurrency` near-equal chunks. Chunks run one after
//! another and the uploads inside a chunk run concurrently. A failed upload
//! does not stop the batch; the job fails at the end so the queue retries it,
//! and the retry finds the already-replicated files unmodified.

use super::{ContentSource, upload::upload_object};
use crate::{
    models::receipts::{BulkUploadReceipt, UploadStatus},
    services::cloud_client::CloudClient,
};
use anyhow::{Result, bail};
use futures::future::join_all;
use rand::seq::SliceRandom;
use tracing::{error, info};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Split `paths` into at most `concurrency` chunks of `ceil(len / concurrency)`.
pub fn partition(paths: &[String], concurrency: usize) -> Vec<Vec<String>> {
    if paths.is_empty() {
        return Vec::new();
    }
    let chunk_size = paths.len().div_ceil(concurrency.max(1));
    paths.chunks(chunk_size).map(<[String]>::to_vec).collect()
}

pub async fn upload_bulk(
    cloud: &CloudClient,
    source: &dyn ContentSource,
    bucket: &str,
    mut paths: Vec<String>,
    concurrency: usize,
    shuffle: bool,
) -> Result<BulkUploadReceipt> {
    if shuffle {
        paths.shuffle(&mut rand::rng());
    }
    let chunks = partition(&paths, concurrency);
    info!(
        bucket = %bucket,
        files = paths.len(),
        chunks = chunks.len(),
        "starting bulk upload"
    );

    let mut receipt = BulkUploadReceipt {
        bucket: bucket.to_string(),
        ..Default::default()
    };
    let mut failures = Vec::new();

    for chunk in &chunks {
        let results = join_all(
            chunk
                .iter()
                .map(|path| upload_object(cloud, source, bucket, path)),
        )
        .await;

        for (path, result) in chunk.iter().zip(results) {
            match result {
                Ok(upload) => match upload.status {
                    UploadStatus::Uploaded => receipt.uploaded.push(upload.path),
                    UploadStatus::Unmodified => receipt.unmodified.push(upload.path),
                    UploadStatus::Missing => receipt.missing.push(upload.path),
                },
                Err(err) => {
                    error!(bucket = %bucket, path = %path, error = %err, "bulk upload item failed");
                    failures.push(path.clone());
                }
            }
        }
    }

    if !failures.is_empty() {
        bail!(
            "{} of {} uploads to `{}` failed: {}",
            failures.len(),
            paths.len(),
            bucket,
            failures.join(", ")
        );
    }

    info!(
        bucket = %bucket,
        uploaded = receipt.uploaded.len(),
        unmodified = receipt.unmodified.len(),
        missing = receipt.missing.len(),
        "bulk upload finished"
    );
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jobs::testing::harness,
        services::cloud_client::RetryPolicy,
    };
    use bytes::Bytes;
    use chrono::Utc;
    use std::time::Duration;

    fn paths(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{i}")).collect()
    }

    #[test]
    fn partition_uses_ceiling_division() {
        let chunks = partition(&paths(10), 3);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks.concat(), paths(10));

        assert_eq!(partition(&paths(2), 5).len(), 2);
        assert_eq!(partition(&paths(3), 1), vec![paths(3)]);
        assert_eq!(partition(&paths(3), 0), vec![paths(3)]);
        assert!(partition(&[], 4).is_empty());
    }

    #[tokio::test]
    async fn aggregates_uploaded_unmodified_and_missing() {
        let h = harness().await;
        for path in ["d/a.txt", "d/b.txt", "d/c.txt"] {
            h.ctx
                .local
                .write(path, Bytes::from(path.to_string()))
                .await
                .unwrap();
        }
        h.backend.insert("B", "d/b.txt", Bytes::from("d/b.txt"), Utc::now());

        let cloud = h.ctx.cloud.as_ref().unwrap();
        for concurrency in [1, 3] {
            let receipt = upload_bulk(
                cloud,
                h.ctx.source.as_ref(),
                "B",
                vec![
                    "d/a.txt".into(),
                    "d/b.txt".into(),
                    "d/c.txt".into(),
                    "d/gone.txt".into(),
                ],
                concurrency,
                false,
            )
            .await
            .unwrap();

            if concurrency == 1 {
                assert_eq!(receipt.uploaded, vec!["d/a.txt", "d/c.txt"]);
                assert_eq!(receipt.unmodified, vec!["d/b.txt"]);
            } else {
                assert!(receipt.uploaded.is_empty());
                assert_eq!(receipt.unmodified, vec!["d/a.txt", "d/b.txt", "d/c.txt"]);
            }
            assert_eq!(receipt.missing, vec!["d/gone.txt"]);
        }
        assert_eq!(h.backend.keys("B"), vec!["d/a.txt", "d/b.txt", "d/c.txt"]);
    }

    #[tokio::test]
    async fn shuffle_keeps_every_path() {
        let h = harness().await;
        let all = paths(20);
        for path in &all {
            h.ctx.local.write(path, Bytes::from_static(b"x")).await.unwrap();
        }
        let cloud = h.ctx.cloud.as_ref().unwrap();
        let mut receipt = upload_bulk(cloud, h.ctx.source.as_ref(), "B", all.clone(), 4, true)
            .await
            .unwrap();
        receipt.uploaded.sort();
        let mut expected = all;
        expected.sort();
        assert_eq!(receipt.uploaded, expected);
    }

    #[tokio::test]
    async fn failed_items_fail_the_job_after_the_batch() {
        let h = harness().await;
        for path in ["a", "b"] {
            h.ctx.local.write(path, Bytes::from_static(b"x")).await.unwrap();
        }
        let cloud = h.ctx.cloud.clone().unwrap().with_retry(RetryPolicy {
            max_attempts: 1,
            backoff_step: Duration::ZERO,
        });
        h.backend.fail_next_puts(1);

        let err = upload_bulk(
            &cloud,
            h.ctx.source.as_ref(),
            "B",
            vec!["a".into(), "b".into()],
            1,
            false,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("1 of 2 uploads"));
        // The other file still made it.
        assert_eq!(h.backend.keys("B").len(), 1);
    }
}
