//! Fixed-delay driver for [`ChunkProcessor`]s.
//!
//! A [`BatchRunner`] hands one task to a [`Scheduler`]; the task runs a single
//! chunk per tick and tells the scheduler to stop once the processor reports
//! completion. The next tick is only timed after the previous one returns, so
//! chunks of one runner never overlap.
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointContext, ChunkProcessor};

/// What a scheduled task wants after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Again,
    Done,
}

pub type Task = Box<dyn FnMut() -> BoxFuture<'static, Tick> + Send>;

pub trait Scheduler: Send + Sync {
    /// Runs `task` after `initial_delay`, then again `delay` after each run
    /// returns, until it yields [`Tick::Done`] or the handle is cancelled.
    fn schedule_with_fixed_delay(
        &self,
        task: Task,
        initial_delay: Duration,
        delay: Duration,
    ) -> CancelHandle;
}

/// Stops further ticks. A tick already running is allowed to finish.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// Scheduler backed by a spawned tokio task per schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_with_fixed_delay(
        &self,
        mut task: Task,
        initial_delay: Duration,
        delay: Duration,
    ) -> CancelHandle {
        let handle = CancelHandle::new();
        let cancel = handle.clone();
        tokio::spawn(async move {
            let mut wait = initial_delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                if task().await == Tick::Done {
                    break;
                }
                wait = delay;
            }
        });
        handle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Cancelled | RunnerState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub ticks: u64,
    pub last_processed: Option<usize>,
    pub consecutive_faults: u32,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub initial_delay: Duration,
    pub delay: Duration,
    /// Upper bound on a single chunk; a chunk that overruns counts as a fault.
    pub chunk_timeout: Option<Duration>,
    /// Consecutive faulted ticks before giving up. `0` retries forever.
    pub max_consecutive_faults: u32,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            delay: Duration::from_millis(100),
            chunk_timeout: None,
            max_consecutive_faults: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner {name} already started (state: {state:?})")]
    AlreadyStarted { name: String, state: RunnerState },
}

/// Single-use driver for one chunked job. Cloning shares the same run.
#[derive(Clone)]
pub struct BatchRunner {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    options: RunnerOptions,
    status: watch::Sender<RunnerStatus>,
    cancel_requested: AtomicBool,
    handle: OnceCell<CancelHandle>,
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("name", &self.inner.name)
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    pub fn new(name: impl Into<String>, options: RunnerOptions) -> Self {
        let (status, _) = watch::channel(RunnerStatus {
            state: RunnerState::Idle,
            ticks: 0,
            last_processed: None,
            consecutive_faults: 0,
        });
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                status,
                cancel_requested: AtomicBool::new(false),
                handle: OnceCell::new(),
            }),
        }
    }

    /// A runner for a job with no input, already `Completed` after zero ticks.
    pub fn completed(name: impl Into<String>, options: RunnerOptions) -> Self {
        let runner = Self::new(name, options);
        runner.inner.status.send_modify(|s| s.state = RunnerState::Completed);
        runner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> RunnerStatus {
        self.inner.status.borrow().clone()
    }

    /// Hands the processor to `scheduler`. Only valid once, from `Idle`.
    pub fn start<P>(
        &self,
        scheduler: &dyn Scheduler,
        processor: P,
        ctx: CheckpointContext,
    ) -> Result<(), RunnerError>
    where
        P: ChunkProcessor + 'static,
    {
        let mut started = false;
        self.inner.status.send_if_modified(|s| {
            if s.state == RunnerState::Idle {
                s.state = RunnerState::Scheduled;
                started = true;
            }
            started
        });
        if !started {
            return Err(RunnerError::AlreadyStarted {
                name: self.inner.name.clone(),
                state: self.status().state,
            });
        }

        let work = Arc::new(Mutex::new((processor, ctx)));
        let inner = self.inner.clone();
        let task: Task = Box::new(move || {
            let inner = inner.clone();
            let work = work.clone();
            async move { inner.tick(&work).await }.boxed()
        });
        let opts = &self.inner.options;
        let handle = scheduler.schedule_with_fixed_delay(task, opts.initial_delay, opts.delay);
        if self.inner.cancel_requested.load(Ordering::SeqCst) {
            handle.cancel();
        }
        let _ = self.inner.handle.set(handle);
        info!(runner = %self.inner.name, "scheduled");
        Ok(())
    }

    /// Prevents further ticks. An in-flight chunk finishes first.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.handle.get() {
            handle.cancel();
        }
        let changed = self.inner.status.send_if_modified(|s| {
            if matches!(s.state, RunnerState::Idle | RunnerState::Scheduled) {
                s.state = RunnerState::Cancelled;
                true
            } else {
                false
            }
        });
        if changed {
            info!(runner = %self.inner.name, "cancelled");
        } else {
            debug!(runner = %self.inner.name, "cancel requested");
        }
    }

    /// Resolves once the runner reaches a terminal state.
    pub async fn wait(&self) -> RunnerStatus {
        let mut rx = self.inner.status.subscribe();
        let result = rx.wait_for(|s| s.state.is_terminal()).await;
        match result {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }
}

impl Inner {
    async fn tick<P: ChunkProcessor>(&self, work: &Mutex<(P, CheckpointContext)>) -> Tick {
        // Claim the tick; anything but Scheduled means cancelled or finished.
        let mut began = false;
        self.status.send_if_modified(|s| {
            if s.state == RunnerState::Scheduled {
                s.state = RunnerState::Running;
                began = true;
            }
            began
        });
        if !began {
            return Tick::Done;
        }

        let mut guard = work.lock().await;
        let (processor, ctx) = &mut *guard;
        let tick = self.status.borrow().ticks + 1;
        debug!(runner = %self.name, tick, last_processed = ?ctx.last_processed(), "chunk start");

        // Run the chunk. A panic or timeout is a fault like any other error.
        let fut = AssertUnwindSafe(processor.process(ctx)).catch_unwind();
        let outcome = match self.options.chunk_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(caught) => caught,
                Err(_) => Ok(Err(anyhow::anyhow!("chunk timed out after {limit:?}"))),
            },
            None => fut.await,
        };
        let result = match outcome {
            Ok(Ok(done)) => Ok(done),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(payload) => Err(format!("chunk panicked: {}", panic_message(&*payload))),
        };
        let last_processed = ctx.last_processed();
        drop(guard);

        // Record the outcome, then pick the next state: finished work wins,
        // then the fault ceiling, then a pending cancel.
        let cancel_requested = self.cancel_requested.load(Ordering::SeqCst);
        let max_faults = self.options.max_consecutive_faults;
        let mut next = Tick::Again;
        self.status.send_modify(|s| {
            s.ticks = tick;
            s.last_processed = last_processed;
            match &result {
                Ok(true) => {
                    s.consecutive_faults = 0;
                    s.state = RunnerState::Completed;
                    next = Tick::Done;
                }
                Ok(false) => s.consecutive_faults = 0,
                Err(_) => s.consecutive_faults += 1,
            }
            if next == Tick::Again {
                if max_faults > 0 && s.consecutive_faults >= max_faults {
                    s.state = RunnerState::Failed;
                    next = Tick::Done;
                } else if cancel_requested {
                    s.state = RunnerState::Cancelled;
                    next = Tick::Done;
                } else {
                    s.state = RunnerState::Scheduled;
                }
            }
        });

        let status = self.status.borrow().clone();
        match (&result, status.state) {
            (Err(msg), RunnerState::Failed) => {
                error!(runner = %self.name, tick, faults = status.consecutive_faults, error = %msg, "giving up after repeated faults")
            }
            (Err(msg), _) => {
                warn!(runner = %self.name, tick, faults = status.consecutive_faults, error = %msg, "chunk failed; retrying next tick")
            }
            (Ok(_), RunnerState::Completed) => {
                info!(runner = %self.name, ticks = tick, last_processed = ?last_processed, "completed")
            }
            (Ok(_), RunnerState::Cancelled) => {
                info!(runner = %self.name, ticks = tick, "cancelled after in-flight chunk")
            }
            _ => debug!(runner = %self.name, tick, last_processed = ?last_processed, "chunk done"),
        }
        next
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
