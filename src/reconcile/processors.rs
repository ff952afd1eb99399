use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ChunkReport, Reconciler};
use crate::checkpoint::{CheckpointContext, ChunkProcessor};
use crate::crm::IdKind;
use crate::db;
use crate::model::{RemoteSnapshot, SyncMode};

/// Walks a list of remote ids, fetching and applying one window per tick.
pub(super) struct SnapshotFetchProcessor {
    reconciler: Reconciler,
    ids: Vec<String>,
    kind: IdKind,
    mode: SyncMode,
    tally: Arc<Mutex<ChunkReport>>,
}

impl SnapshotFetchProcessor {
    pub(super) fn new(
        reconciler: Reconciler,
        ids: Vec<String>,
        kind: IdKind,
        mode: SyncMode,
        tally: Arc<Mutex<ChunkReport>>,
    ) -> Self {
        Self {
            reconciler,
            ids,
            kind,
            mode,
            tally,
        }
    }
}

#[async_trait]
impl ChunkProcessor for SnapshotFetchProcessor {
    async fn process(&mut self, ctx: &mut CheckpointContext) -> Result<bool> {
        let total = self.ids.len();
        let Some(window) = ctx.next_window(total) else {
            return Ok(true);
        };
        let group = &self.ids[window.clone()];
        // A failed fetch leaves the cursor alone so the runner retries this window.
        let snapshots = self
            .reconciler
            .crm()
            .fetch_snapshots_by_ids(group, self.kind)
            .await
            .with_context(|| format!("fetching {:?} ids {}..{}", self.kind, window.start, window.end))?;
        if self.kind == IdKind::Opportunity && snapshots.len() < group.len() {
            debug!(
                requested = group.len(),
                returned = snapshots.len(),
                "some open opportunities are no longer visible in the CRM"
            );
        }

        let report = self.reconciler.process_one_chunk(&snapshots, self.mode).await;
        self.tally.lock().await.merge(&report);
        ctx.complete(&window);
        info!(
            mode = self.mode.as_str(),
            done = window.end,
            total,
            "sync progress"
        );
        Ok(ctx.is_exhausted(total))
    }
}

/// Applies snapshots fetched up front, then moves the watermark to the newest
/// modification time that has nothing failed at or before it.
pub(super) struct ChangedSinceProcessor {
    reconciler: Reconciler,
    snapshots: Vec<RemoteSnapshot>,
    watermark_key: &'static str,
    tally: Arc<Mutex<ChunkReport>>,
    failed: Vec<usize>,
}

impl ChangedSinceProcessor {
    pub(super) fn new(
        reconciler: Reconciler,
        snapshots: Vec<RemoteSnapshot>,
        watermark_key: &'static str,
        tally: Arc<Mutex<ChunkReport>>,
    ) -> Self {
        Self {
            reconciler,
            snapshots,
            watermark_key,
            tally,
            failed: Vec::new(),
        }
    }
}

#[async_trait]
impl ChunkProcessor for ChangedSinceProcessor {
    async fn process(&mut self, ctx: &mut CheckpointContext) -> Result<bool> {
        let total = self.snapshots.len();
        if let Some(window) = ctx.next_window(total) {
            let (report, failed) = self
                .reconciler
                .apply_chunk(&self.snapshots[window.clone()], SyncMode::ChangedSince)
                .await;
            self.tally.lock().await.merge(&report);
            self.failed
                .extend(failed.into_iter().map(|i| window.start + i));
            ctx.complete(&window);
            if !ctx.is_exhausted(total) {
                return Ok(false);
            }
        }

        // Retried on its own if the write fails: the window is already consumed.
        match watermark_target(&self.snapshots, &self.failed) {
            Some(newest) => {
                db::set_sync_watermark(self.reconciler.pool(), self.watermark_key, newest)
                    .await
                    .context("failed to advance sync watermark")?;
                info!(watermark = %newest, "sync watermark advanced");
            }
            None if !self.failed.is_empty() => {
                warn!(failed = self.failed.len(), "sync watermark held back by failed records");
            }
            None => {}
        }
        Ok(true)
    }
}

/// Newest modification time strictly older than every failed snapshot, so the
/// next run fetches the failures again. A failed snapshot without a
/// modification time pins the watermark where it is.
fn watermark_target(snapshots: &[RemoteSnapshot], failed: &[usize]) -> Option<DateTime<Utc>> {
    let mut ceiling: Option<DateTime<Utc>> = None;
    for &idx in failed {
        let t = snapshots.get(idx)?.last_modified?;
        ceiling = Some(ceiling.map_or(t, |c| c.min(t)));
    }
    snapshots
        .iter()
        .filter_map(|s| s.last_modified)
        .filter(|t| ceiling.map_or(true, |c| *t < c))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> RemoteSnapshot {
        RemoteSnapshot {
            id: format!("opp-{hour}"),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 5, 2, hour, 0, 0).unwrap()),
            ..RemoteSnapshot::default()
        }
    }

    #[test]
    fn watermark_is_newest_when_nothing_failed() {
        let snaps = vec![at(9), at(11), at(10)];
        assert_eq!(watermark_target(&snaps, &[]), snaps[1].last_modified);
    }

    #[test]
    fn watermark_stays_below_oldest_failure() {
        let snaps = vec![at(8), at(9), at(10), at(11)];
        assert_eq!(watermark_target(&snaps, &[3, 2]), snaps[1].last_modified);
        assert_eq!(watermark_target(&snaps, &[0]), None);
    }

    #[test]
    fn failure_without_timestamp_holds_watermark() {
        let mut undated = at(12);
        undated.last_modified = None;
        let snaps = vec![at(8), undated];
        assert_eq!(watermark_target(&snaps, &[1]), None);
    }
}
