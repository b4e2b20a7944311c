// ========================================================================================
//
//                          The data producer: lines in, batches out
//
// ========================================================================================
//
// ### Purpose ###
//
// This module turns a raw byte stream into line scores and groups those scores into
// fixed-capacity batches for the compute stage. Storage for each batch is taken from
// the shared buffer pool that the consumer refills, so a steady-state run allocates
// nothing.

use crate::pipeline::{PipelineContext, PipelineError};
use crate::queue::QueueSender;
use crate::types::{LineIndex, Score, ScoredBatch};
use log::{debug, warn};
use memchr::memchr;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Size of each read from the underlying stream.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

const LINE_TERMINATOR: u8 = b'\n';

/// The score of a single line, terminator excluded.
#[inline]
pub fn score_line(line: &[u8]) -> Score {
    line.iter().map(|&byte| Score::from(byte)).sum()
}

/// Opens the input file. Failing here stops the run before any stage is started.
pub fn open_input(path: &Path) -> Result<File, PipelineError> {
    File::open(path).map_err(|source| PipelineError::Startup {
        path: path.to_path_buf(),
        source,
    })
}

/// Pulls one score per terminated line out of a byte stream.
///
/// The running sum is carried across read boundaries, so a line may span any number
/// of chunks. Bytes after the final terminator are not a line; they are counted and
/// can be inspected with [`LineReader::unterminated_bytes`] once the stream ends.
pub struct LineReader<R> {
    reader: R,
    buffer: Box<[u8]>,
    pos: usize,
    filled: usize,
    running: Score,
    pending_bytes: u64,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, READ_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0u8; chunk_size.max(1)].into_boxed_slice(),
            pos: 0,
            filled: 0,
            running: 0,
            pending_bytes: 0,
            eof: false,
        }
    }

    /// Returns the next line's score, or `None` at end of stream.
    pub fn next_score(&mut self) -> io::Result<Option<Score>> {
        loop {
            let window = &self.buffer[self.pos..self.filled];
            if let Some(offset) = memchr(LINE_TERMINATOR, window) {
                let score = self.running + score_line(&window[..offset]);
                self.running = 0;
                self.pending_bytes = 0;
                self.pos += offset + 1;
                return Ok(Some(score));
            }

            self.running += score_line(window);
            self.pending_bytes += window.len() as u64;
            self.pos = self.filled;

            if self.eof {
                return Ok(None);
            }
            match self.reader.read(&mut self.buffer) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.pos = 0;
                    self.filled = n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes seen since the last terminator.
    pub fn unterminated_bytes(&self) -> u64 {
        self.pending_bytes
    }
}

/// What the producer read before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub lines: u64,
    pub batches: u64,
    pub unterminated_bytes: u64,
}

/// The entry point for the producer thread.
///
/// Reads `reader` to the end, pushing every full batch onto `batches` as soon as it
/// fills and the final partial batch (if it holds any score) at the end. The queue is
/// finished as the very last action, on success and on failure alike. A failure also
/// cancels the rest of the pipeline.
pub fn producer_thread<R: Read>(
    reader: R,
    batches: QueueSender<ScoredBatch>,
    context: &PipelineContext,
) -> Result<ProducerReport, PipelineError> {
    let result = produce_batches(reader, &batches, context);
    if let Err(e) = &result {
        debug!("producer failed, cancelling the pipeline: {e}");
        context.cancelled.set();
    }
    batches.finish();
    result
}

fn produce_batches<R: Read>(
    reader: R,
    batches: &QueueSender<ScoredBatch>,
    context: &PipelineContext,
) -> Result<ProducerReport, PipelineError> {
    let capacity = context.config.batch_capacity;
    let mut lines = LineReader::new(reader);
    let mut report = ProducerReport::default();
    let mut batch = ScoredBatch::allocate(LineIndex(0), capacity, &context.buffer_pool)?;

    while let Some(score) = lines.next_score().map_err(PipelineError::Read)? {
        batch.push(score);
        if !batch.is_full() {
            continue;
        }

        let next = ScoredBatch::allocate(batch.end(), capacity, &context.buffer_pool)?;
        let full = std::mem::replace(&mut batch, next);
        if !submit(full, batches, context, &mut report) || context.cancelled.is_set() {
            debug!("producer stopping early after {} lines", report.lines);
            return Ok(report);
        }
    }

    if !batch.is_empty() {
        submit(batch, batches, context, &mut report);
    }

    report.unterminated_bytes = lines.unterminated_bytes();
    if report.unterminated_bytes > 0 {
        warn!(
            "input ends with {} bytes after the last line break; they do not form a line and were ignored",
            report.unterminated_bytes
        );
    }
    debug!(
        "producer finished: {} lines in {} batches",
        report.lines, report.batches
    );
    Ok(report)
}

/// Pushes `batch` downstream. Returns `false` once the compute stage has gone away.
fn submit(
    batch: ScoredBatch,
    batches: &QueueSender<ScoredBatch>,
    context: &PipelineContext,
    report: &mut ProducerReport,
) -> bool {
    let count = batch.count();
    if batches.push(batch).is_err() {
        return false;
    }
    report.lines += count as u64;
    report.batches += 1;
    context.stats.record_batch_read(count);
    true
}
