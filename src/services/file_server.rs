//! src/services/file_server.rs
//!
//! FileServer composes the local tier, the optional cloud tier and the job
//! queue into the file-store commands. Local I/O happens inline; cloud
//! writes are only ever enqueued. The one synchronous cloud call is the read
//! fallback on a local miss.

use crate::{
    errors::AppError,
    models::{
        job::Job,
        object::StoredObject,
        stats::{DiffReport, LocalStats, StatsReport},
    },
    services::{
        cloud_client::CloudClient,
        job_queue::JobQueue,
        local_store::{LocalStore, join_path},
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::io;
use tokio::fs::File;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

/// Manifest written next to the files of an extracted archive.
pub const MANIFEST_FILE: &str = "void.manifest.json";

/// The replica bucket and a client for it.
#[derive(Clone)]
pub struct CloudTier {
    pub client: CloudClient,
    pub bucket: String,
}

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct FileServer {
    pub local: LocalStore,
    /// `None` means a pure local store: nothing is enqueued or fetched remotely.
    pub cloud: Option<CloudTier>,
    pub queue: JobQueue,
}

pub enum ObjectBody {
    File(File),
    Bytes(Bytes),
}

/// A file found in one of the tiers, ready to be streamed out.
pub struct LoadedObject {
    pub path: String,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub body: ObjectBody,
    pub from_cloud: bool,
}

impl FileServer {
    pub fn new(local: LocalStore, cloud: Option<CloudTier>, queue: JobQueue) -> Self {
        Self {
            local,
            cloud,
            queue,
        }
    }

    pub fn bucket(&self) -> Option<&str> {
        self.cloud.as_ref().map(|tier| tier.bucket.as_str())
    }

    async fn enqueue_for_bucket(&self, job: impl FnOnce(&str) -> Job) -> Result<(), AppError> {
        if let Some(bucket) = self.bucket() {
            let job = job(bucket);
            let id = self.queue.enqueue(&job).await?;
            debug!(job.id = %id, job.name = job.name(), "scheduled cloud replication");
        }
        Ok(())
    }

    /// The local copy only. Workers read through this so a file gone from
    /// disk is reported missing even when the bucket still has it.
    pub async fn load_local(&self, path: &str) -> Result<Option<LoadedObject>, AppError> {
        let Some((object, file)) = self.local.open(path).await? else {
            return Ok(None);
        };
        Ok(Some(LoadedObject {
            path: object.path,
            size_bytes: object.size_bytes,
            last_modified: Some(object.last_modified),
            body: ObjectBody::File(file),
            from_cloud: false,
        }))
    }

    /// Local first; on a miss, the bucket if one is configured.
    pub async fn load(&self, path: &str) -> Result<Option<LoadedObject>, AppError> {
        let path = LocalStore::normalize(path)?;
        if let Some(object) = self.load_local(&path).await? {
            return Ok(Some(object));
        }

        let Some(tier) = &self.cloud else {
            return Ok(None);
        };
        let Some(remote) = tier.client.get(&tier.bucket, &path).await? else {
            return Ok(None);
        };
        debug!(path = %path, bucket = %tier.bucket, "served from cloud tier");
        Ok(Some(LoadedObject {
            path,
            size_bytes: remote.body.len() as u64,
            last_modified: remote.meta.last_modified,
            body: ObjectBody::Bytes(remote.body),
            from_cloud: true,
        }))
    }

    /// Paths below `prefix`, relative to it. Empty when nothing matches.
    pub async fn ls(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        Ok(self.local.list(prefix).await?)
    }

    /// Write a file locally, then schedule its replication.
    pub async fn save<S>(&self, path: &str, body: S) -> Result<StoredObject, AppError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let object = self.local.write_stream(path, body).await?;
        self.enqueue_for_bucket(|bucket| Job::upload(object.path.clone(), bucket))
            .await?;
        info!(path = %object.path, size_bytes = object.size_bytes, "saved");
        Ok(object)
    }

    /// Remove one file. Returns the canonical path.
    ///
    /// A file missing locally is still deleted from the bucket; without a
    /// bucket it is a 404.
    pub async fn delete(&self, path: &str) -> Result<String, AppError> {
        let path = LocalStore::normalize(path)?;
        let removed = self.local.remove_file(&path).await?;
        if !removed && self.cloud.is_none() {
            return Err(AppError::not_found());
        }
        self.enqueue_for_bucket(|bucket| Job::delete(path.clone(), bucket))
            .await?;
        info!(path = %path, removed, "deleted");
        Ok(path)
    }

    /// Remove a directory tree. Returns the canonical path.
    pub async fn rmdir(&self, path: &str) -> Result<String, AppError> {
        let path = LocalStore::normalize(path)?;
        let removed = self.local.remove_dir(&path).await?;
        if !removed && self.cloud.is_none() {
            return Err(AppError::not_found());
        }
        self.enqueue_for_bucket(|bucket| Job::remove_directory(path.clone(), bucket))
            .await?;
        info!(path = %path, removed, "deleted directory");
        Ok(path)
    }

    /// Unpack a tar+gzip body under `path`, write the manifest and schedule
    /// one bulk upload for everything. Returns the extracted store paths,
    /// manifest last.
    pub async fn extract<S>(&self, path: &str, body: S) -> Result<Vec<String>, AppError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let dir = LocalStore::normalize(path)?;
        let reader = SyncIoBridge::new(StreamReader::new(Box::pin(body)));
        let local = self.local.clone();
        let target = dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || local.extract_archive_blocking(&target, reader))
                .await
                .map_err(|err| AppError::internal(format!("extraction task failed: {}", err)))??;

        let manifest_path = join_path(&dir, MANIFEST_FILE);
        let mut paths: Vec<String> = extracted
            .into_iter()
            .filter(|p| *p != manifest_path)
            .collect();
        let relative: Vec<&str> = paths
            .iter()
            .map(|p| relative_to(&dir, p))
            .collect();
        let manifest = serde_json::to_vec_pretty(&relative)
            .map_err(|err| AppError::internal(err.to_string()))?;
        self.local.write(&manifest_path, Bytes::from(manifest)).await?;
        paths.push(manifest_path);

        if let Some(bucket) = self.bucket() {
            let job = Job::upload_bulk(paths.clone(), bucket);
            let id = self.queue.enqueue(&job).await?;
            debug!(job.id = %id, files = paths.len(), "scheduled bulk replication");
        }
        info!(path = %dir, files = paths.len(), "archive extracted");
        Ok(paths)
    }

    /// Local totals, plus bucket totals when a bucket is configured.
    pub async fn stats(&self) -> Result<StatsReport, AppError> {
        let (count, bytes) = self.local.stats().await?;
        let local = LocalStats {
            root: self.local.root().display().to_string(),
            count,
            bytes,
        };
        let s3 = match &self.cloud {
            Some(tier) => Some(tier.client.stats(&tier.bucket).await?),
            None => None,
        };
        Ok(StatsReport { local, s3 })
    }

    /// Paths under `prefix` present in only one tier.
    pub async fn diff(&self, prefix: &str) -> Result<DiffReport, AppError> {
        let Some(tier) = &self.cloud else {
            return Err(AppError::bad_request("diff requires a configured bucket"));
        };
        let prefix = LocalStore::normalize(prefix)?;
        let local = self.local.list_paths(&prefix).await?;
        let remote_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };
        let remote = tier
            .client
            .list_all_keys(&tier.bucket, &remote_prefix)
            .await?;
        Ok(DiffReport::compare(prefix, &local, &remote))
    }
}

fn relative_to<'a>(dir: &str, path: &'a str) -> &'a str {
    if dir.is_empty() {
        path
    } else {
        path.strip_prefix(dir)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::memory_backend::InMemoryBackend};
    use flate2::{Compression, write::GzEncoder};
    use futures::stream;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: Arc<InMemoryBackend>,
        server: FileServer,
    }

    async fn fixture(with_bucket: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let cloud = with_bucket.then(|| CloudTier {
            client: CloudClient::new(backend.clone()),
            bucket: "B".into(),
        });
        let server = FileServer::new(
            LocalStore::new(dir.path().join("files")),
            cloud,
            JobQueue::new(pool),
        );
        Fixture {
            _dir: dir,
            backend,
            server,
        }
    }

    fn body(content: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::once(async move { Ok(Bytes::from_static(content)) })
    }

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn save_and_delete_enqueue_only_with_bucket() {
        let f = fixture(false).await;
        f.server.save("a/b.txt", body(b"x")).await.unwrap();
        f.server.delete("a/b.txt").await.unwrap();
        assert!(f.server.queue.pending_jobs().await.unwrap().is_empty());
        assert_eq!(
            f.server.delete("a/b.txt").await.unwrap_err().status,
            axum::http::StatusCode::NOT_FOUND
        );

        let f = fixture(true).await;
        f.server.save("/a/b.txt", body(b"x")).await.unwrap();
        f.server.delete("a/b.txt").await.unwrap();
        assert_eq!(
            f.server.queue.pending_jobs().await.unwrap(),
            vec![Job::upload("a/b.txt", "B"), Job::delete("a/b.txt", "B")]
        );
    }

    #[tokio::test]
    async fn load_falls_back_to_bucket() {
        let f = fixture(true).await;
        f.backend
            .insert("B", "remote/only.txt", &b"from cloud"[..], Utc::now());

        let loaded = f.server.load("remote/only.txt").await.unwrap().unwrap();
        assert!(loaded.from_cloud);
        assert!(matches!(loaded.body, ObjectBody::Bytes(ref b) if b.as_ref() == b"from cloud"));
        assert!(f.server.load("remote/none.txt").await.unwrap().is_none());
        assert!(f.server.queue.pending_jobs().await.unwrap().is_empty());

        assert!(f.server.load_local("remote/only.txt").await.unwrap().is_none());
        // The root is a directory, never an object in either tier.
        for root in ["", "/"] {
            assert!(matches!(
                f.server.load(root).await,
                Err(err) if err.status == axum::http::StatusCode::BAD_REQUEST
            ));
        }
    }

    #[tokio::test]
    async fn extract_writes_manifest_and_one_bulk_job() {
        let f = fixture(true).await;
        let archive = tarball(&[
            ("folder/first.txt", b"first item"),
            ("folder/second.txt", b"second item"),
        ]);
        let paths = f
            .server
            .extract(
                "foo/bar",
                stream::once(async move { Ok(Bytes::from(archive)) }),
            )
            .await
            .unwrap();

        let expected = vec![
            "foo/bar/folder/first.txt".to_string(),
            "foo/bar/folder/second.txt".to_string(),
            "foo/bar/void.manifest.json".to_string(),
        ];
        assert_eq!(paths, expected);
        assert_eq!(
            f.server.queue.pending_jobs().await.unwrap(),
            vec![Job::upload_bulk(expected, "B")]
        );

        let manifest = f
            .server
            .local
            .read("foo/bar/void.manifest.json")
            .await
            .unwrap()
            .unwrap();
        let listed: Vec<String> = serde_json::from_slice(&manifest).unwrap();
        assert_eq!(listed, vec!["folder/first.txt", "folder/second.txt"]);
    }

    #[tokio::test]
    async fn diff_compares_tiers_under_prefix() {
        let f = fixture(true).await;
        for path in ["g/a.txt", "g/b.txt", "other/c.txt"] {
            f.server.local.write(path, Bytes::from_static(b"x")).await.unwrap();
        }
        for key in ["g/b.txt", "g/z %281%29.txt", "gx/nope.txt"] {
            f.backend.insert("B", key, &b"x"[..], Utc::now());
        }

        let report = f.server.diff("g").await.unwrap();
        assert_eq!(report.missing_remote, vec!["g/a.txt"]);
        assert_eq!(report.missing_local, vec!["g/z (1).txt"]);

        let f = fixture(false).await;
        assert_eq!(
            f.server.diff("g").await.unwrap_err().status,
            axum::http::StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn stats_include_bucket_when_configured() {
        let f = fixture(true).await;
        f.server.save("a", body(b"12")).await.unwrap();
        f.server.save("b/c", body(b"345")).await.unwrap();
        f.backend.insert("B", "a", &b"12"[..], Utc::now());

        let report = f.server.stats().await.unwrap();
        assert_eq!((report.local.count, report.local.bytes), (2, 5));
        let s3 = report.s3.unwrap();
        assert_eq!((s3.bucket.as_str(), s3.count, s3.bytes), ("B", 1, 2));
    }
}
