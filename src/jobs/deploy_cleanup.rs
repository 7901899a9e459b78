//! `deploy:cleanup`: delete unpinned deploys past their expiry window.

use crate::{
    models::receipts::DeploySweepReceipt,
    services::deploy_repository::{DEFAULT_EXPIRY_DAYS, DeployRepository},
};
use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::info;

pub async fn sweep_expired_deploys(
    deploys: &dyn DeployRepository,
    age_in_days: Option<u32>,
) -> Result<DeploySweepReceipt> {
    let days = age_in_days.unwrap_or(DEFAULT_EXPIRY_DAYS);
    let cutoff = Utc::now() - Duration::days(days as i64);

    let expired = deploys.expired(cutoff).await?;
    for deploy in &expired {
        deploys.delete(deploy).await?;
    }

    info!(deleted = expired.len(), age_in_days = days, "deploy cleanup finished");
    Ok(DeploySweepReceipt {
        deleted: expired.len() as u64,
        cleaned_on: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{jobs::testing::harness, models::job::Job};

    #[tokio::test]
    async fn deletes_only_expired_unpinned_deploys() {
        let h = harness().await;
        let now = Utc::now();
        let old = h
            .deploys
            .register_at("deploys/old", now - Duration::days(31))
            .await
            .unwrap();
        let week_old = h
            .deploys
            .register_at("deploys/week", now - Duration::days(8))
            .await
            .unwrap();
        let pinned = h
            .deploys
            .register_at("deploys/pinned", now - Duration::days(90))
            .await
            .unwrap();
        h.deploys.set_pinned(pinned.id, true).await.unwrap();

        let receipt = sweep_expired_deploys(h.deploys.as_ref(), None).await.unwrap();
        assert_eq!(receipt.deleted, 1);
        assert!(h.deploys.get(old.id).await.unwrap().is_none());
        assert_eq!(
            h.queue.pending_jobs().await.unwrap(),
            vec![
                Job::FileRemoveDirectory {
                    path: "deploys/old".into()
                },
                Job::remove_directory("deploys/old", "B"),
            ]
        );

        let receipt = sweep_expired_deploys(h.deploys.as_ref(), Some(7)).await.unwrap();
        assert_eq!(receipt.deleted, 1);
        assert!(h.deploys.get(week_old.id).await.unwrap().is_none());
        assert!(h.deploys.get(pinned.id).await.unwrap().is_some());
    }
}
