//! Progress cursor for chunked batch jobs and the processor contract that consumes it.
use async_trait::async_trait;
use std::ops::Range;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("chunk size must be > 0")]
    ZeroChunkSize,
}

/// How far a batch job has progressed.
///
/// `last_processed` is the index of the last item handled, `None` before the
/// first chunk. It never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointContext {
    last_processed: Option<usize>,
    chunk_size: usize,
}

impl CheckpointContext {
    pub fn new(chunk_size: usize) -> Result<Self, CheckpointError> {
        if chunk_size == 0 {
            return Err(CheckpointError::ZeroChunkSize);
        }
        Ok(Self {
            last_processed: None,
            chunk_size,
        })
    }

    pub fn last_processed(&self) -> Option<usize> {
        self.last_processed
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Index of the first item not yet handled.
    pub fn next_index(&self) -> usize {
        self.last_processed.map_or(0, |i| i + 1)
    }

    /// The next window of at most `chunk_size` items out of `total`, clamped to
    /// the end of the input. `None` once everything has been consumed.
    pub fn next_window(&self, total: usize) -> Option<Range<usize>> {
        let start = self.next_index();
        if start >= total {
            return None;
        }
        let end = start.saturating_add(self.chunk_size).min(total);
        Some(start..end)
    }

    /// Marks every item of `window` as handled.
    pub fn complete(&mut self, window: &Range<usize>) {
        if window.is_empty() {
            return;
        }
        self.advance_to(window.end - 1);
    }

    pub fn advance_to(&mut self, index: usize) {
        match self.last_processed {
            Some(current) if index < current => {
                warn!(current, requested = index, "ignoring checkpoint regression");
            }
            _ => self.last_processed = Some(index),
        }
    }

    pub fn is_exhausted(&self, total: usize) -> bool {
        self.next_index() >= total
    }
}

/// One step of a chunked job.
///
/// `process` handles the next chunk described by `ctx`, writes the new cursor
/// back into it, and returns `true` once the whole input has been consumed.
/// An empty input must report `true` on the first call. Invoking it twice with
/// the same cursor must be safe.
#[async_trait]
pub trait ChunkProcessor: Send {
    async fn process(&mut self, ctx: &mut CheckpointContext) -> anyhow::Result<bool>;
}
