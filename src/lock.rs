//! Named leases that keep two instances from running the same job at once.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, Pool};

/// Proof of holding a named lease until `until` (or an earlier release).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub owner: String,
    pub until: DateTime<Utc>,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// `Ok(None)` when someone else holds an unexpired lease.
    async fn try_acquire(&self, name: &str, hold_for: Duration) -> Result<Option<LockLease>>;
    async fn release(&self, lease: &LockLease) -> Result<()>;
}

/// Lease stored in the `job_locks` table. Only serialises processes that
/// share the same database file.
#[derive(Debug, Clone)]
pub struct SqliteLock {
    pool: Pool,
    instance: String,
}

impl SqliteLock {
    pub fn new(pool: Pool, instance: impl Into<String>) -> Self {
        Self {
            pool,
            instance: instance.into(),
        }
    }
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn try_acquire(&self, name: &str, hold_for: Duration) -> Result<Option<LockLease>> {
        let now = Utc::now();
        let hold = chrono::Duration::from_std(hold_for)?;
        let until = now + hold;
        let owner = format!("{}:{}", self.instance, Uuid::new_v4());
        let acquired = db::try_acquire_lock(
            &self.pool,
            name,
            &owner,
            now.timestamp_millis(),
            until.timestamp_millis(),
        )
        .await?;
        if !acquired {
            debug!(lock = name, "lease held elsewhere");
            return Ok(None);
        }
        info!(lock = name, %owner, %until, "lease acquired");
        Ok(Some(LockLease {
            name: name.to_string(),
            owner,
            until,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        let released = db::release_lock(
            &self.pool,
            &lease.name,
            &lease.owner,
            Utc::now().timestamp_millis(),
        )
        .await?;
        if released {
            info!(lock = %lease.name, "lease released");
        } else {
            warn!(lock = %lease.name, owner = %lease.owner, "lease had already expired or changed hands");
        }
        Ok(())
    }
}
