// ========================================================================================
//
//                  The lane kernel: a two-phase, barrier-separated transform
//
// ========================================================================================
//
// This module owns the only arithmetic in the pipeline: turning a run of scores into
// adjacent differences. The parallel version splits the run into contiguous lanes,
// one per pool thread, and works in two phases:
//
//   1. every lane reads the untouched scores and writes its differences into a
//      private scratch buffer;
//   2. after a barrier, every lane copies its scratch over its own slice.
//
// The last difference of lane `k` needs the first score of lane `k + 1`, which lane
// `k + 1` overwrites in phase 2. Those boundary scores are copied out before any lane
// starts, so every lane only ever touches its own slice.

use crate::types::Score;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::ops::Range;
use std::sync::{Barrier, Mutex, PoisonError};

/// Splits the difference range `[0, diff_len)` into contiguous lanes.
///
/// At most `lanes` ranges are returned, never an empty one, so fewer ranges come back
/// when there are fewer differences than lanes. Lengths differ by at most one, with
/// the longer lanes first, and the last range always ends at `diff_len`.
pub fn lane_ranges(diff_len: usize, lanes: usize) -> Vec<Range<usize>> {
    let active = lanes.min(diff_len);
    if active == 0 {
        return Vec::new();
    }

    let base = diff_len / active;
    let remainder = diff_len % active;
    let mut ranges = Vec::with_capacity(active);
    let mut cursor = 0;
    for lane in 0..active {
        let len = base + usize::from(lane < remainder);
        ranges.push(cursor..cursor + len);
        cursor += len;
    }
    debug_assert_eq!(cursor, diff_len);
    ranges
}

/// The single-threaded transform. Walking forwards is safe in place because slot
/// `i + 1` is read before it is ever written.
///
/// Returns the number of differences now held at the front of `scores`.
pub fn diff_in_place(scores: &mut [Score]) -> usize {
    let diff_len = scores.len().saturating_sub(1);
    for i in 0..diff_len {
        scores[i] -= scores[i + 1];
    }
    diff_len
}

/// A fixed set of lane threads that runs the two-phase transform one batch at a time.
pub struct LaneExecutor {
    pool: ThreadPool,
    lanes: usize,
    // Every lane blocks at the barrier, so two batches sharing the pool could each
    // hold threads the other one waits for.
    one_batch: Mutex<()>,
}

impl LaneExecutor {
    pub fn new(lanes: usize) -> Result<Self, ThreadPoolBuildError> {
        let lanes = lanes.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(lanes)
            .thread_name(|i| format!("scorecard-lane-{i}"))
            .build()?;
        Ok(Self {
            pool,
            lanes,
            one_batch: Mutex::new(()),
        })
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Replaces `scores[..len - 1]` with adjacent differences and returns that length.
    ///
    /// The final slot keeps its original score; it has no successor in this slice.
    pub fn transform(&self, scores: &mut [Score]) -> usize {
        let diff_len = scores.len().saturating_sub(1);
        let ranges = lane_ranges(diff_len, self.lanes);
        if ranges.len() <= 1 {
            return diff_in_place(scores);
        }

        let successors: Vec<Score> = ranges.iter().map(|range| scores[range.end]).collect();
        let barrier = Barrier::new(ranges.len());
        let guard = self.one_batch.lock().unwrap_or_else(PoisonError::into_inner);

        let mut rest = &mut scores[..diff_len];
        self.pool.in_place_scope(|s| {
            for (range, &successor) in ranges.iter().zip(&successors) {
                let (lane, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
                rest = tail;
                let barrier = &barrier;
                s.spawn(move |_| run_lane(lane, successor, barrier));
            }
        });

        drop(guard);
        diff_len
    }
}

fn run_lane(lane: &mut [Score], successor: Score, barrier: &Barrier) {
    // Phase 1: read-only, results go to scratch.
    let mut scratch = Vec::with_capacity(lane.len());
    scratch.extend(lane.windows(2).map(|pair| pair[0] - pair[1]));
    if let Some(&last) = lane.last() {
        scratch.push(last - successor);
    }

    barrier.wait();

    // Phase 2: every lane has finished reading.
    lane.copy_from_slice(&scratch);
}
