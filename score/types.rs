// ========================================================================================
//                             High-level data contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use crate::kernel::LaneExecutor;
use crate::pipeline::PipelineError;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The score of one line: the sum of its byte values. Wide enough that no realistic
/// line can overflow it.
pub type Score = i64;

/// A 0-based position of a line in the whole input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LineIndex(pub u64);

impl LineIndex {
    #[inline]
    pub fn offset(self, by: usize) -> Self {
        Self(self.0 + by as u64)
    }
}

impl fmt::Display for LineIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A run of consecutive line scores, as produced by the reader.
///
/// The batch never holds more than `capacity` scores, and a batch that reaches a
/// queue always holds at least one.
#[derive(Debug)]
pub struct ScoredBatch {
    start: LineIndex,
    capacity: usize,
    scores: Vec<Score>,
}

impl ScoredBatch {
    /// Starts an empty batch at `start`, reusing a buffer from `pool` when one is free.
    ///
    /// Storage for the full `capacity` is reserved up front; failing to get it is
    /// reported as [`PipelineError::Allocation`] rather than aborting the process.
    pub fn allocate(
        start: LineIndex,
        capacity: usize,
        pool: &ArrayQueue<Vec<Score>>,
    ) -> Result<Self, PipelineError> {
        let mut scores = pool.pop().unwrap_or_default();
        scores.clear();
        scores
            .try_reserve_exact(capacity)
            .map_err(|source| PipelineError::Allocation {
                requested: capacity,
                source,
            })?;
        Ok(Self {
            start,
            capacity,
            scores,
        })
    }

    /// Builds a batch directly from scores. `capacity` is taken to be the number of scores.
    pub fn from_scores(start: LineIndex, scores: Vec<Score>) -> Self {
        Self {
            start,
            capacity: scores.len(),
            scores,
        }
    }

    #[inline]
    pub fn push(&mut self, score: Score) {
        debug_assert!(self.scores.len() < self.capacity, "batch overfilled");
        self.scores.push(score);
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.scores.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn start(&self) -> LineIndex {
        self.start
    }

    pub fn count(&self) -> usize {
        self.scores.len()
    }

    /// The index of the first line after this batch.
    pub fn end(&self) -> LineIndex {
        self.start.offset(self.scores.len())
    }

    pub fn scores(&self) -> &[Score] {
        &self.scores
    }

    /// Runs the adjacent-difference transform over this batch's own scores.
    ///
    /// The result reuses the same allocation. Only pairs inside the batch are
    /// differenced: the last score has no successor here, even if the stream
    /// continues in the next batch.
    pub fn into_diffs(self, kernel: &LaneExecutor) -> DiffBatch {
        let Self {
            start, mut scores, ..
        } = self;
        let diff_len = kernel.transform(&mut scores);
        scores.truncate(diff_len);
        DiffBatch {
            start,
            diffs: scores,
        }
    }
}

/// A batch after the transform: `diffs[i]` is `score[start+i] - score[start+i+1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffBatch {
    start: LineIndex,
    diffs: Vec<Score>,
}

impl DiffBatch {
    pub fn start(&self) -> LineIndex {
        self.start
    }

    pub fn diffs(&self) -> &[Score] {
        &self.diffs
    }

    /// Hands the underlying buffer back so it can be recycled.
    pub fn into_buffer(self) -> Vec<Score> {
        self.diffs
    }
}

/// Counters the stages bump as work moves through the pipeline.
///
/// Updated once per batch, so a reader polling them sees batch-sized steps.
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_scored: AtomicU64,
    batches_read: AtomicU64,
    batches_computed: AtomicU64,
    diffs_emitted: AtomicU64,
}

impl PipelineStats {
    pub fn record_batch_read(&self, lines: usize) {
        self.lines_scored.fetch_add(lines as u64, Ordering::Relaxed);
        self.batches_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_computed(&self) {
        self.batches_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_diffs_emitted(&self, diffs: usize) {
        self.diffs_emitted.fetch_add(diffs as u64, Ordering::Relaxed);
    }

    pub fn lines_scored(&self) -> u64 {
        self.lines_scored.load(Ordering::Relaxed)
    }

    pub fn batches_read(&self) -> u64 {
        self.batches_read.load(Ordering::Relaxed)
    }

    pub fn batches_computed(&self) -> u64 {
        self.batches_computed.load(Ordering::Relaxed)
    }

    pub fn diffs_emitted(&self) -> u64 {
        self.diffs_emitted.load(Ordering::Relaxed)
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub lines: u64,
    pub batches: u64,
    pub diffs: u64,
    /// Bytes after the last line terminator. They do not form a line and were dropped.
    pub unterminated_bytes: u64,
    pub elapsed: Duration,
}
