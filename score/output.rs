// ========================================================================================
//                         The result consumer: ordered emission
// ========================================================================================

use crate::pipeline::{PipelineContext, PipelineError};
use crate::queue::ThreadSafeQueue;
use crate::types::{DiffBatch, LineIndex, Score};
use log::debug;
use std::io::{self, BufWriter, Write};

/// Writes one result line: `"<i>-<i+1>: <diff>"`.
#[inline]
pub fn write_pair<W: Write>(out: &mut W, first: LineIndex, diff: Score) -> io::Result<()> {
    writeln!(out, "{}-{}: {}", first.0, first.0 + 1, diff)
}

/// Writes every difference of `batch` in ascending line order and returns how many.
pub fn write_batch<W: Write>(out: &mut W, batch: &DiffBatch) -> io::Result<usize> {
    for (offset, &diff) in batch.diffs().iter().enumerate() {
        write_pair(out, batch.start().offset(offset), diff)?;
    }
    Ok(batch.diffs().len())
}

/// The entry point for the consumer thread.
///
/// Drains `results` until the compute stage has finished it and it is empty, writing
/// each batch as it arrives and returning its buffer to the pool. Returns the number
/// of result lines written. A write failure cancels the pipeline, and the queue is
/// dropped on the way out so the compute stage stops pushing into it.
pub fn consumer_thread<W: Write>(
    sink: W,
    results: ThreadSafeQueue<DiffBatch>,
    context: &PipelineContext,
) -> Result<u64, PipelineError> {
    let result = drain_results(sink, &results, context);
    if let Err(e) = &result {
        debug!("consumer failed, cancelling the pipeline: {e}");
        context.cancelled.set();
    }
    drop(results);
    result
}

fn drain_results<W: Write>(
    sink: W,
    results: &ThreadSafeQueue<DiffBatch>,
    context: &PipelineContext,
) -> Result<u64, PipelineError> {
    let mut out = BufWriter::new(sink);
    let mut written: u64 = 0;

    while let Some(batch) = results.pop_wait() {
        if context.cancelled.is_set() {
            debug!("consumer stopping early after {written} results");
            break;
        }
        let count = write_batch(&mut out, &batch).map_err(PipelineError::Write)?;
        written += count as u64;
        context.stats.record_diffs_emitted(count);
        // A full pool just means this buffer is freed instead of recycled.
        let _ = context.buffer_pool.push(batch.into_buffer());
    }

    out.flush().map_err(PipelineError::Write)?;
    debug!("consumer finished: {written} results written");
    Ok(written)
}
