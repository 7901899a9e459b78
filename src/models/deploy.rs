//! Represents a deploy record consulted by the expiry sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A deploy: a directory of uploaded files owned by the wider domain model.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Deploy {
    /// Unique identifier for this deploy.
    pub id: Uuid,

    /// Directory prefix holding the deploy's files.
    pub path: String,

    /// Pinned deploys never expire.
    pub pinned: bool,

    /// Creation time as unix milliseconds.
    pub created_at: i64,
}

impl Deploy {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at)
    }
}
