//! Deploy records consulted by the expiry sweep.
//!
//! Deleting a deploy removes the record and enqueues the storage cleanup for
//! its directory: `file:rmdir` always, `s3:rmdir` when a bucket is configured.

use crate::{
    models::{deploy::Deploy, job::Job},
    services::job_queue::JobQueue,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

/// Default age after which an unpinned deploy expires.
pub const DEFAULT_EXPIRY_DAYS: u32 = 30;

#[async_trait]
pub trait DeployRepository: Send + Sync {
    /// Unpinned deploys created before `older_than`, oldest first.
    async fn expired(&self, older_than: DateTime<Utc>) -> Result<Vec<Deploy>>;

    /// Remove a deploy and schedule removal of its files.
    async fn delete(&self, deploy: &Deploy) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SqliteDeployRepository {
    pool: SqlitePool,
    queue: JobQueue,
    bucket: Option<String>,
}

impl SqliteDeployRepository {
    pub fn new(pool: SqlitePool, queue: JobQueue, bucket: Option<String>) -> Self {
        Self {
            pool,
            queue,
            bucket,
        }
    }

    /// Record a deploy directory created now.
    pub async fn register(&self, path: &str) -> Result<Deploy> {
        self.register_at(path, Utc::now()).await
    }

    /// Record a deploy directory with an explicit creation time. Registering
    /// an existing path refreshes its creation time.
    pub async fn register_at(&self, path: &str, created_at: DateTime<Utc>) -> Result<Deploy> {
        let deploy = sqlx::query_as::<_, Deploy>(
            "INSERT INTO deploys (id, path, pinned, created_at) VALUES (?1, ?2, 0, ?3) \
             ON CONFLICT(path) DO UPDATE SET created_at = excluded.created_at \
             RETURNING id, path, pinned, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(path)
        .bind(created_at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(deploy)
    }

    /// Pin or unpin a deploy. Returns `false` if it does not exist.
    pub async fn set_pinned(&self, id: Uuid, pinned: bool) -> Result<bool> {
        let updated = sqlx::query("UPDATE deploys SET pinned = ?2 WHERE id = ?1")
            .bind(id)
            .bind(pinned)
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() > 0)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Deploy>> {
        let deploy = sqlx::query_as::<_, Deploy>(
            "SELECT id, path, pinned, created_at FROM deploys WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deploy)
    }
}

#[async_trait]
impl DeployRepository for SqliteDeployRepository {
    async fn expired(&self, older_than: DateTime<Utc>) -> Result<Vec<Deploy>> {
        let deploys = sqlx::query_as::<_, Deploy>(
            "SELECT id, path, pinned, created_at FROM deploys \
             WHERE pinned = 0 AND created_at < ?1 ORDER BY created_at",
        )
        .bind(older_than.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(deploys)
    }

    async fn delete(&self, deploy: &Deploy) -> Result<()> {
        sqlx::query("DELETE FROM deploys WHERE id = ?1")
            .bind(deploy.id)
            .execute(&self.pool)
            .await?;

        self.queue
            .enqueue(&Job::FileRemoveDirectory {
                path: deploy.path.clone(),
            })
            .await?;
        if let Some(bucket) = &self.bucket {
            self.queue
                .enqueue(&Job::remove_directory(deploy.path.clone(), bucket.clone()))
                .await?;
        }
        info!(deploy.id = %deploy.id, path = %deploy.path, "deleted deploy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;

    async fn repository(bucket: Option<&str>) -> (tempfile::TempDir, SqliteDeployRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let queue = JobQueue::new(pool.clone());
        let repo = SqliteDeployRepository::new(pool, queue, bucket.map(str::to_string));
        (dir, repo)
    }

    #[tokio::test]
    async fn expired_skips_pinned_and_recent() {
        let (_dir, repo) = repository(None).await;
        let old = Utc::now() - Duration::days(40);
        let stale = repo.register_at("deploys/1", old).await.unwrap();
        let pinned = repo.register_at("deploys/2", old).await.unwrap();
        repo.register("deploys/3").await.unwrap();
        assert!(repo.set_pinned(pinned.id, true).await.unwrap());
        assert!(!repo.set_pinned(Uuid::new_v4(), true).await.unwrap());

        let cutoff = Utc::now() - Duration::days(DEFAULT_EXPIRY_DAYS as i64);
        let expired = repo.expired(cutoff).await.unwrap();
        assert_eq!(expired, vec![stale]);
    }

    #[tokio::test]
    async fn delete_enqueues_storage_cleanup() {
        let (_dir, repo) = repository(Some("B")).await;
        let deploy = repo.register("deploys/7").await.unwrap();
        repo.delete(&deploy).await.unwrap();

        assert!(repo.get(deploy.id).await.unwrap().is_none());
        assert_eq!(
            repo.queue.pending_jobs().await.unwrap(),
            vec![
                Job::FileRemoveDirectory {
                    path: "deploys/7".into()
                },
                Job::remove_directory("deploys/7", "B"),
            ]
        );
    }
}
