//! Keeps local opportunities in line with the CRM.
//!
//! Every trigger takes a named lease, builds a chunk processor over its input
//! and hands it to a [`BatchRunner`]. Each chunk goes through
//! [`Reconciler::process_one_chunk`], which isolates failures per item: one bad
//! record is logged and counted, the rest of the chunk still applies.
use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::checkpoint::{CheckpointContext, CheckpointError, ChunkProcessor};
use crate::config::{Config, SyncSettings};
use crate::crm::{CrmClient, CrmService, IdKind};
use crate::db::{self, NewOpportunity, Pool, StoreError};
use crate::differ::{ChangeSet, SnapshotDiffer};
use crate::lock::{DistributedLock, LockLease, SqliteLock};
use crate::model::{Candidate, JobOpp, Opportunity, RemoteSnapshot, SyncMode};
use crate::notify::telegram::TelegramRelay;
use crate::notify::{ChatPostStore, Fanout, NotificationSink, OppNotifier};
use crate::runner::{
    BatchRunner, RunnerError, RunnerOptions, RunnerState, RunnerStatus, Scheduler, TokioScheduler,
};
use crate::stage::{auto_status, Stage, StageTransition};

mod processors;

use processors::{ChangedSinceProcessor, SnapshotFetchProcessor};

pub const FULL_SYNC_JOB: &str = "opportunity-full-sync";
pub const INCREMENTAL_SYNC_JOB: &str = "opportunity-incremental-sync";
pub const CHANGED_SINCE_SYNC_JOB: &str = "opportunity-changed-since-sync";

/// Look-back used by the changed-since sync before any watermark exists.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 7;

/// Errors raised when a sync is triggered, before anything is scheduled.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("full sync needs at least one job id")]
    NoJobIds,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("lock error: {0:#}")]
    Lock(anyhow::Error),
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
    #[error("crm error: {0:#}")]
    Remote(anyhow::Error),
}

/// Why one snapshot could not be applied.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("no local opportunity for remote id {0}")]
    MissingLocal(String),
    #[error("snapshot {0} has no {1}")]
    Incomplete(String, &'static str),
    #[error("no local candidate with number {0}")]
    MissingCandidate(String),
    #[error("no local job with remote id {0}")]
    MissingJob(String),
    #[error(transparent)]
    Conflict(StoreError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<StoreError> for ItemError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => ItemError::Conflict(e),
            StoreError::Sqlx(inner) => ItemError::Store(inner.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Created,
    /// Saved; `side_effect_failures` follow-ups did not go through.
    Updated { side_effect_failures: u64 },
    Unchanged,
}

/// Per-chunk (or per-job, once merged) counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    /// Follow-ups (relocation, status, notes) that failed after a saved update.
    pub side_effect_failures: u64,
}

impl ChunkReport {
    /// Records actually written.
    pub fn mutated(&self) -> u64 {
        self.created + self.updated
    }

    /// Records seen but not written.
    pub fn skipped(&self) -> u64 {
        self.unchanged + self.failed
    }

    pub fn total(&self) -> u64 {
        self.mutated() + self.skipped()
    }

    pub fn merge(&mut self, other: &ChunkReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.side_effect_failures += other.side_effect_failures;
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub chunk_size: usize,
    pub full_sync_group_size: usize,
    pub runner: RunnerOptions,
    pub lock_hold: Duration,
}

impl ReconcileOptions {
    pub fn from_settings(s: &SyncSettings) -> Self {
        Self {
            chunk_size: s.chunk_size,
            full_sync_group_size: s.full_sync_group_size,
            runner: s.runner_options(),
            lock_hold: s.lock_hold(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedRunnerStatus {
    pub name: String,
    #[serde(flatten)]
    pub status: RunnerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileStatus {
    pub running: bool,
    pub items_processed: u64,
    pub items_updated: u64,
    pub items_skipped: u64,
    pub items_failed: u64,
    pub side_effect_failures: u64,
    pub runners: Vec<NamedRunnerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub status: RunnerStatus,
    pub report: ChunkReport,
}

impl SyncSummary {
    /// Operator-facing one-liner.
    pub fn describe(&self) -> String {
        format!(
            "{} records updated, {} skipped",
            self.report.mutated(),
            self.report.skipped()
        )
    }
}

/// A triggered sync. Finishing waits for the runner and the lease release.
#[derive(Debug)]
pub struct SyncJob {
    runner: BatchRunner,
    tally: Arc<Mutex<ChunkReport>>,
    done: JoinHandle<()>,
}

impl SyncJob {
    pub fn runner(&self) -> &BatchRunner {
        &self.runner
    }

    pub fn cancel(&self) {
        self.runner.cancel();
    }

    pub async fn finish(self) -> SyncSummary {
        if let Err(e) = self.done.await {
            warn!(runner = self.runner.name(), error = %e, "lease release task failed");
        }
        let status = self.runner.wait().await;
        let report = *self.tally.lock().await;
        SyncSummary { status, report }
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    side_effects: AtomicU64,
}

impl Counters {
    fn add(&self, r: &ChunkReport) {
        self.processed.fetch_add(r.total(), Ordering::Relaxed);
        self.updated.fetch_add(r.mutated(), Ordering::Relaxed);
        self.skipped.fetch_add(r.unchanged, Ordering::Relaxed);
        self.failed.fetch_add(r.failed, Ordering::Relaxed);
        self.side_effects
            .fetch_add(r.side_effect_failures, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    crm: Arc<dyn CrmService>,
    notifier: OppNotifier,
    differ: SnapshotDiffer,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<dyn DistributedLock>,
    options: ReconcileOptions,
    counters: Counters,
    runners: Mutex<Vec<BatchRunner>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        pool: Pool,
        crm: Arc<dyn CrmService>,
        sink: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<dyn DistributedLock>,
        options: ReconcileOptions,
    ) -> Self {
        Self::with_differ(pool, crm, sink, scheduler, lock, options, SnapshotDiffer::default())
    }

    pub fn with_differ(
        pool: Pool,
        crm: Arc<dyn CrmService>,
        sink: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<dyn DistributedLock>,
        options: ReconcileOptions,
        differ: SnapshotDiffer,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                crm,
                notifier: OppNotifier::new(sink),
                differ,
                scheduler,
                lock,
                options,
                counters: Counters::default(),
                runners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Production wiring: CRM over HTTP, posts stored locally and relayed to
    /// Telegram when configured, leases in SQLite.
    pub fn from_config(cfg: &Config, pool: Pool) -> anyhow::Result<Self> {
        let crm = Arc::new(CrmClient::from_config(&cfg.crm)?);
        let mut sink = Fanout::new().with(Arc::new(ChatPostStore::new(pool.clone())));
        if let Some(tg) = &cfg.notifications.telegram {
            sink = sink.with(Arc::new(TelegramRelay::from_config(tg)));
        }
        let lock = Arc::new(SqliteLock::new(pool.clone(), cfg.app.instance_name.clone()));
        Ok(Self::new(
            pool,
            crm,
            Arc::new(sink),
            Arc::new(TokioScheduler),
            lock,
            ReconcileOptions::from_settings(&cfg.sync),
        ))
    }

    pub(crate) fn crm(&self) -> &dyn CrmService {
        self.inner.crm.as_ref()
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// Upserts every candidate opportunity under the given remote job ids,
    /// `full_sync_group_size` jobs per tick.
    pub async fn trigger_full_sync(&self, job_ids: Vec<String>) -> Result<Option<SyncJob>, SyncError> {
        let ids = dedupe_ids(job_ids);
        if ids.is_empty() {
            return Err(SyncError::NoJobIds);
        }
        let ctx = CheckpointContext::new(self.inner.options.full_sync_group_size)?;
        let Some(lease) = self.acquire(FULL_SYNC_JOB).await? else {
            return Ok(None);
        };
        info!(jobs = ids.len(), "starting full sync");
        let tally = Arc::new(Mutex::new(ChunkReport::default()));
        let processor = SnapshotFetchProcessor::new(
            self.clone(),
            ids,
            IdKind::ParentJob,
            SyncMode::Full,
            tally.clone(),
        );
        self.launch(FULL_SYNC_JOB, processor, ctx, lease, tally).await.map(Some)
    }

    /// Re-checks every locally open opportunity against the CRM.
    /// `Ok(None)` when another instance holds the lease.
    pub async fn trigger_incremental_sync(&self) -> Result<Option<SyncJob>, SyncError> {
        let ctx = CheckpointContext::new(self.inner.options.chunk_size)?;
        let Some(lease) = self.acquire(INCREMENTAL_SYNC_JOB).await? else {
            return Ok(None);
        };
        let ids = match db::find_open_opportunity_remote_ids(&self.inner.pool).await {
            Ok(ids) => ids,
            Err(e) => {
                self.release(&lease).await;
                return Err(SyncError::Store(e));
            }
        };
        let tally = Arc::new(Mutex::new(ChunkReport::default()));
        if ids.is_empty() {
            info!("no open opportunities; incremental sync has nothing to do");
            return Ok(Some(self.finished(INCREMENTAL_SYNC_JOB, lease, tally).await));
        }
        info!(open = ids.len(), "starting incremental sync");
        let processor = SnapshotFetchProcessor::new(
            self.clone(),
            ids,
            IdKind::Opportunity,
            SyncMode::Incremental,
            tally.clone(),
        );
        self.launch(INCREMENTAL_SYNC_JOB, processor, ctx, lease, tally)
            .await
            .map(Some)
    }

    /// Applies open CRM records modified since the stored watermark, then
    /// moves the watermark forward.
    pub async fn trigger_changed_since_sync(&self) -> Result<Option<SyncJob>, SyncError> {
        let ctx = CheckpointContext::new(self.inner.options.chunk_size)?;
        let Some(lease) = self.acquire(CHANGED_SINCE_SYNC_JOB).await? else {
            return Ok(None);
        };
        let fetched = async {
            let since = db::get_sync_watermark(&self.inner.pool, CHANGED_SINCE_SYNC_JOB)
                .await
                .map_err(SyncError::Store)?
                .unwrap_or_else(|| Utc::now() - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS));
            let snapshots = self
                .inner
                .crm
                .fetch_snapshots_open_since(since)
                .await
                .map_err(SyncError::Remote)?;
            Ok::<_, SyncError>((since, snapshots))
        }
        .await;
        let (since, snapshots) = match fetched {
            Ok(v) => v,
            Err(e) => {
                self.release(&lease).await;
                return Err(e);
            }
        };
        let tally = Arc::new(Mutex::new(ChunkReport::default()));
        if snapshots.is_empty() {
            info!(%since, "no CRM changes since watermark");
            return Ok(Some(self.finished(CHANGED_SINCE_SYNC_JOB, lease, tally).await));
        }
        info!(%since, changed = snapshots.len(), "starting changed-since sync");
        let processor = ChangedSinceProcessor::new(
            self.clone(),
            snapshots,
            CHANGED_SINCE_SYNC_JOB,
            tally.clone(),
        );
        self.launch(CHANGED_SINCE_SYNC_JOB, processor, ctx, lease, tally)
            .await
            .map(Some)
    }

    pub async fn status(&self) -> ReconcileStatus {
        let runners: Vec<NamedRunnerStatus> = self
            .inner
            .runners
            .lock()
            .await
            .iter()
            .map(|r| NamedRunnerStatus {
                name: r.name().to_string(),
                status: r.status(),
            })
            .collect();
        let c = &self.inner.counters;
        ReconcileStatus {
            running: runners.iter().any(|r| !r.status.state.is_terminal()),
            items_processed: c.processed.load(Ordering::Relaxed),
            items_updated: c.updated.load(Ordering::Relaxed),
            items_skipped: c.skipped.load(Ordering::Relaxed),
            items_failed: c.failed.load(Ordering::Relaxed),
            side_effect_failures: c.side_effects.load(Ordering::Relaxed),
            runners,
        }
    }

    /// Applies one chunk of snapshots. Never fails as a whole: each item is
    /// handled on its own and failures are logged with the remote id.
    pub async fn process_one_chunk(&self, snapshots: &[RemoteSnapshot], mode: SyncMode) -> ChunkReport {
        self.apply_chunk(snapshots, mode).await.0
    }

    /// Like [`Self::process_one_chunk`], also returning the positions of the
    /// snapshots that failed.
    #[instrument(skip_all, fields(mode = mode.as_str(), size = snapshots.len()))]
    pub(crate) async fn apply_chunk(
        &self,
        snapshots: &[RemoteSnapshot],
        mode: SyncMode,
    ) -> (ChunkReport, Vec<usize>) {
        let mut report = ChunkReport::default();
        let mut failed_at = Vec::new();
        for (idx, snap) in snapshots.iter().enumerate() {
            match self.sync_one(snap, mode).await {
                Ok(ItemOutcome::Created) => report.created += 1,
                Ok(ItemOutcome::Updated {
                    side_effect_failures,
                }) => {
                    report.updated += 1;
                    report.side_effect_failures += side_effect_failures;
                }
                Ok(ItemOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    failed_at.push(idx);
                    warn!(remote_id = %snap.id, error = %e, "failed to sync opportunity");
                }
            }
        }
        self.inner.counters.add(&report);
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            side_effect_failures = report.side_effect_failures,
            "chunk applied"
        );
        (report, failed_at)
    }

    async fn sync_one(&self, snap: &RemoteSnapshot, mode: SyncMode) -> Result<ItemOutcome, ItemError> {
        let pool = &self.inner.pool;
        let (mut opp, created) = match db::find_opportunity_by_remote_id(pool, &snap.id).await? {
            Some(opp) => (opp, false),
            None if mode.creates_missing() => (self.create_from_snapshot(snap).await?, true),
            None => return Err(ItemError::MissingLocal(snap.id.clone())),
        };

        let changes = self.inner.differ.diff(snap, &opp);
        if changes.is_empty() {
            return Ok(if created {
                ItemOutcome::Created
            } else {
                ItemOutcome::Unchanged
            });
        }

        let transition = changes.apply_to(&mut opp);
        let saved = db::save_opportunity(pool, &opp).await?;
        info!(
            remote_id = %snap.id,
            fields = ?changes.fields(),
            version = saved.version,
            "opportunity updated"
        );

        if created {
            return Ok(ItemOutcome::Created);
        }
        let side_effect_failures = self.after_save(snap, &saved, &changes, transition).await;
        Ok(ItemOutcome::Updated {
            side_effect_failures,
        })
    }

    async fn create_from_snapshot(&self, snap: &RemoteSnapshot) -> Result<Opportunity, ItemError> {
        let pool = &self.inner.pool;
        let number = snap
            .candidate_number
            .as_deref()
            .ok_or_else(|| ItemError::Incomplete(snap.id.clone(), "candidate number"))?;
        let job_remote_id = snap
            .parent_job_id
            .as_deref()
            .ok_or_else(|| ItemError::Incomplete(snap.id.clone(), "parent job"))?;
        let candidate = db::find_candidate_by_number(pool, number)
            .await?
            .ok_or_else(|| ItemError::MissingCandidate(number.to_string()))?;
        let job = db::find_job_opp_by_remote_id(pool, job_remote_id)
            .await?
            .ok_or_else(|| ItemError::MissingJob(job_remote_id.to_string()))?;

        let stage = snap
            .stage_name
            .as_deref()
            .and_then(Stage::from_crm_name)
            .unwrap_or(Stage::Prospect);
        let id = db::insert_opportunity(
            pool,
            &NewOpportunity {
                remote_id: Some(snap.id.clone()),
                candidate_id: candidate.id,
                job_opp_id: job.id,
                name: snap.name.clone(),
                stage,
            },
        )
        .await?;
        info!(remote_id = %snap.id, id, stage = stage.as_str(), "opportunity created");
        db::find_opportunity_by_id(pool, id)
            .await?
            .context("created opportunity vanished")
            .map_err(ItemError::Store)
    }

    /// Runs the follow-ups of a saved update. Each step stands alone: a failed
    /// relocation or status write is logged and counted, and the chat posts
    /// still go out. Returns the number of failed steps.
    async fn after_save(
        &self,
        snap: &RemoteSnapshot,
        opp: &Opportunity,
        changes: &ChangeSet,
        transition: Option<StageTransition>,
    ) -> u64 {
        let (candidate, job) = match self.parties(opp).await {
            Ok(parties) => parties,
            Err(e) => {
                warn!(remote_id = %snap.id, error = %e, "could not load candidate or job after save");
                return 1;
            }
        };
        let mut failures = 0;

        if let Some(t) = transition {
            if t.reaches_relocation() {
                if let Err(e) = self.record_relocation(snap, &candidate, &job, t).await {
                    warn!(remote_id = %snap.id, error = %e, "relocation update failed");
                    failures += 1;
                }
            }
            if let Err(e) = self.apply_auto_status(&candidate, &job, t).await {
                warn!(remote_id = %snap.id, error = %e, "candidate status update failed");
                failures += 1;
            }
            self.inner
                .notifier
                .notify_stage_change(opp, &candidate, &job, t)
                .await;
        }

        if changes.next_step.is_some() || changes.next_step_due_date.is_some() {
            self.inner
                .notifier
                .notify_next_step_change(opp, &candidate, &job)
                .await;
        }
        failures
    }

    async fn parties(&self, opp: &Opportunity) -> anyhow::Result<(Candidate, JobOpp)> {
        let pool = &self.inner.pool;
        let candidate = db::find_candidate_by_id(pool, opp.candidate_id)
            .await?
            .with_context(|| format!("candidate {} not found", opp.candidate_id))?;
        let job = db::find_job_opp_by_id(pool, opp.job_opp_id)
            .await?
            .with_context(|| format!("job {} not found", opp.job_opp_id))?;
        Ok((candidate, job))
    }

    async fn record_relocation(
        &self,
        snap: &RemoteSnapshot,
        candidate: &Candidate,
        job: &JobOpp,
        t: StageTransition,
    ) -> anyhow::Result<()> {
        let Some(country) = snap.job_country.as_deref().or(job.country.as_deref()) else {
            warn!(remote_id = %snap.id, "relocation stage reached but no country known");
            return Ok(());
        };
        let comment = format!(
            "Relocated to {country} for job '{}' (stage {}).",
            job.name, t.to
        );
        db::set_candidate_relocated_country(
            &self.inner.pool,
            candidate.id,
            country,
            "Relocated country set",
            &comment,
        )
        .await?;
        info!(candidate_id = candidate.id, country, "relocation recorded");
        Ok(())
    }

    async fn apply_auto_status(
        &self,
        candidate: &Candidate,
        job: &JobOpp,
        t: StageTransition,
    ) -> anyhow::Result<()> {
        let Some(status) = auto_status(t.to, candidate.status) else {
            return Ok(());
        };
        let comment = format!(
            "Status changed from {} to {} because case for job '{}' moved to stage {}.",
            candidate.status.as_str(),
            status.as_str(),
            job.name,
            t.to
        );
        db::set_candidate_status(&self.inner.pool, candidate.id, status, "Status change", &comment)
            .await?;
        info!(candidate_id = candidate.id, status = status.as_str(), "candidate status updated");
        Ok(())
    }

    async fn acquire(&self, name: &str) -> Result<Option<LockLease>, SyncError> {
        let lease = self
            .inner
            .lock
            .try_acquire(name, self.inner.options.lock_hold)
            .await
            .map_err(SyncError::Lock)?;
        if lease.is_none() {
            info!(job = name, "sync already running elsewhere; skipping");
        }
        Ok(lease)
    }

    async fn release(&self, lease: &LockLease) {
        if let Err(e) = self.inner.lock.release(lease).await {
            warn!(lock = %lease.name, error = %e, "failed to release lease");
        }
    }

    async fn launch<P>(
        &self,
        name: &str,
        processor: P,
        ctx: CheckpointContext,
        lease: LockLease,
        tally: Arc<Mutex<ChunkReport>>,
    ) -> Result<SyncJob, SyncError>
    where
        P: ChunkProcessor + 'static,
    {
        let runner = BatchRunner::new(name, self.inner.options.runner.clone());
        if let Err(e) = runner.start(self.inner.scheduler.as_ref(), processor, ctx) {
            self.release(&lease).await;
            return Err(e.into());
        }
        self.track(&runner).await;

        let this = self.clone();
        let watched = runner.clone();
        let done = tokio::spawn(async move {
            let status = watched.wait().await;
            this.release(&lease).await;
            if status.state != RunnerState::Completed {
                warn!(runner = watched.name(), state = ?status.state, ticks = status.ticks, "sync did not complete");
            }
        });
        Ok(SyncJob { runner, tally, done })
    }

    /// A job with no input: completes without scheduling a single tick.
    async fn finished(&self, name: &str, lease: LockLease, tally: Arc<Mutex<ChunkReport>>) -> SyncJob {
        let runner = BatchRunner::completed(name, self.inner.options.runner.clone());
        self.release(&lease).await;
        self.track(&runner).await;
        SyncJob {
            runner,
            tally,
            done: tokio::spawn(async {}),
        }
    }

    async fn track(&self, runner: &BatchRunner) {
        let mut runners = self.inner.runners.lock().await;
        runners.retain(|r| !r.status().state.is_terminal());
        runners.push(runner.clone());
    }
}

/// Trims, drops blanks and removes duplicates, keeping first-seen order.
fn dedupe_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
