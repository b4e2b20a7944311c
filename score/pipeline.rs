use crate::config::{ComputeMode, ConfigError, PipelineConfig};
use crate::io::{self, LineReader, ProducerReport};
use crate::kernel::LaneExecutor;
use crate::output;
use crate::queue::{CompletionFlag, QueueSender, ThreadSafeQueue};
use crate::types::{DiffBatch, LineIndex, PipelineStats, PipelineSummary, Score, ScoredBatch};
use crossbeam_queue::ArrayQueue;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use std::collections::TryReserveError;
use std::fmt;
use std::io::{BufWriter, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often the progress spinner re-reads the counters.
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

/// The three long-lived stages of a batched run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Producer,
    Compute,
    Consumer,
}

impl Stage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Compute => "compute",
            Self::Consumer => "consumer",
        }
    }

    fn thread_name(self) -> String {
        format!("scorecard-{}", self.describe())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Everything that can stop a run. The orchestrator reports exactly one of these.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open input '{}': {source}", .path.display())]
    Startup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to allocate storage for a batch of {requested} scores: {source}")]
    Allocation {
        requested: usize,
        source: TryReserveError,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to read the input stream: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write results: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to build the lane thread pool: {0}")]
    LanePool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to start the {stage} thread: {source}")]
    Spawn {
        stage: Stage,
        source: std::io::Error,
    },
    #[error("the {0} thread panicked")]
    StagePanicked(Stage),
}

/// The state shared by the stages of one batched run.
///
/// The queues themselves are owned by the stages they connect. `cancelled` is raised
/// by whichever stage fails first.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub buffer_pool: ArrayQueue<Vec<Score>>,
    pub cancelled: CompletionFlag,
    pub stats: PipelineStats,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            buffer_pool: ArrayQueue::new(config.buffer_pool_size.max(1)),
            cancelled: CompletionFlag::new(),
            stats: PipelineStats::default(),
        }
    }
}

// ========================================================================================
//                                   The compute stage
// ========================================================================================

/// The entry point for the compute thread.
///
/// Takes batches off `batches` in order, runs the lane transform on each and forwards
/// the result to `results`. Returns once the producer has finished `batches` and it is
/// drained, as soon as the run is cancelled, or once the consumer has gone away.
/// Either way `results` is finished on the way out.
pub fn compute_thread(
    batches: ThreadSafeQueue<ScoredBatch>,
    results: QueueSender<DiffBatch>,
    context: &PipelineContext,
    kernel: &LaneExecutor,
) -> u64 {
    let mut computed: u64 = 0;

    while let Some(batch) = batches.pop_wait() {
        if context.cancelled.is_set() {
            debug!("compute stage stopping early after {computed} batches");
            break;
        }
        let diffs = batch.into_diffs(kernel);
        if results.push(diffs).is_err() {
            debug!("consumer is gone; compute stage stopping after {computed} batches");
            break;
        }
        context.stats.record_batch_computed();
        computed += 1;
    }

    // Releases a producer that is still waiting for room.
    drop(batches);
    results.finish();
    debug!("compute stage finished: {computed} batches");
    computed
}

// ========================================================================================
//                                   The orchestrator
// ========================================================================================

/// A validated configuration plus the lane threads that serve it.
///
/// One `Pipeline` can run any number of inputs, one after another.
pub struct Pipeline {
    config: PipelineConfig,
    kernel: LaneExecutor,
}

impl Pipeline {
    /// Validates `config` and starts the lane pool. Nothing is read yet.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let kernel = LaneExecutor::new(config.lane_count)?;
        Ok(Self { config, kernel })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Opens `path` and runs it. The file is opened before any stage starts, so a
    /// missing input fails with [`PipelineError::Startup`] and no output.
    pub fn run_file<W: Write + Send>(
        &self,
        path: &Path,
        sink: W,
    ) -> Result<PipelineSummary, PipelineError> {
        let file = io::open_input(path)?;
        info!("> Reading lines from {}", path.display());
        self.run(file, sink)
    }

    /// Scores every line of `reader` and writes the differences to `sink`.
    pub fn run<R: Read + Send, W: Write + Send>(
        &self,
        reader: R,
        sink: W,
    ) -> Result<PipelineSummary, PipelineError> {
        let summary = match self.config.mode {
            ComputeMode::Batched => self.run_batched(reader, sink)?,
            ComputeMode::Linear => run_linear(reader, sink)?,
        };
        info!(
            "> {} lines, {} batches, {} differences in {:.3}s",
            summary.lines,
            summary.batches,
            summary.diffs,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    fn run_batched<R: Read + Send, W: Write + Send>(
        &self,
        reader: R,
        sink: W,
    ) -> Result<PipelineSummary, PipelineError> {
        let start = Instant::now();
        let context = PipelineContext::new(self.config);
        let run_finished = CompletionFlag::new();
        debug!(
            "starting batched run: batch capacity {}, {} lanes",
            self.config.batch_capacity,
            self.kernel.lanes()
        );

        let outcome = thread::scope(|s| {
            if self.config.progress {
                let context = &context;
                let run_finished = &run_finished;
                s.spawn(move || report_progress(context, run_finished));
            }
            let outcome = self.run_stages(s, reader, sink, &context);
            run_finished.set();
            outcome
        });

        let (report, written) = outcome?;
        debug!(
            "run finished: {} batches read, {} computed, {written} differences written",
            context.stats.batches_read(),
            context.stats.batches_computed()
        );
        Ok(PipelineSummary {
            lines: report.lines,
            batches: context.stats.batches_read(),
            diffs: context.stats.diffs_emitted(),
            unterminated_bytes: report.unterminated_bytes,
            elapsed: start.elapsed(),
        })
    }

    /// Starts producer, compute and consumer in that order, then joins them in the same
    /// order. The first stage to fail determines the error; the others have been
    /// cancelled by then and only drain what they already hold.
    fn run_stages<'scope, 'env, R, W>(
        &'env self,
        s: &'scope Scope<'scope, 'env>,
        reader: R,
        sink: W,
        context: &'env PipelineContext,
    ) -> Result<(ProducerReport, u64), PipelineError>
    where
        R: Read + Send + 'scope,
        W: Write + Send + 'scope,
    {
        let depth = self.config.queue_depth;
        let (batch_sender, batches) = ThreadSafeQueue::bounded(depth);
        let (result_sender, results) = ThreadSafeQueue::bounded(depth);

        let producer = spawn_stage(s, Stage::Producer, context, move || {
            io::producer_thread(reader, batch_sender, context)
        })?;
        let compute = spawn_stage(s, Stage::Compute, context, move || {
            compute_thread(batches, result_sender, context, &self.kernel)
        })?;
        let consumer = spawn_stage(s, Stage::Consumer, context, move || {
            output::consumer_thread(sink, results, context)
        })?;

        let produced = join_stage(producer, Stage::Producer, context);
        let computed = join_stage(compute, Stage::Compute, context);
        let consumed = join_stage(consumer, Stage::Consumer, context);

        let report = produced??;
        let batches = computed?;
        let diffs = consumed??;
        debug!("all stages joined: {batches} batches computed");
        Ok((report, diffs))
    }
}

fn spawn_stage<'scope, 'env, T, F>(
    s: &'scope Scope<'scope, 'env>,
    stage: Stage,
    context: &PipelineContext,
    work: F,
) -> Result<ScopedJoinHandle<'scope, T>, PipelineError>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    thread::Builder::new()
        .name(stage.thread_name())
        .spawn_scoped(s, work)
        .map_err(|source| {
            // The unstarted closure has already dropped its queue ends, which releases
            // any neighbour that did start.
            context.cancelled.set();
            PipelineError::Spawn { stage, source }
        })
}

fn join_stage<T>(
    handle: ScopedJoinHandle<'_, T>,
    stage: Stage,
    context: &PipelineContext,
) -> Result<T, PipelineError> {
    handle.join().map_err(|_| {
        warn!("the {stage} thread panicked; cancelling the run");
        context.cancelled.set();
        PipelineError::StagePanicked(stage)
    })
}

fn report_progress(context: &PipelineContext, run_finished: &CompletionFlag) {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(None, draw_target);
    pb.enable_steady_tick(PROGRESS_POLL_INTERVAL);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {pos} lines scored {msg}")
    {
        pb.set_style(style);
    }

    while !run_finished.is_set() {
        pb.set_position(context.stats.lines_scored());
        pb.set_message(progress_message(&context.stats));
        thread::sleep(PROGRESS_POLL_INTERVAL);
    }
    pb.set_position(context.stats.lines_scored());
    pb.finish_with_message("done.");
}

fn progress_message(stats: &PipelineStats) -> String {
    format!(
        "({} batches read, {} computed, {} differences written)",
        stats.batches_read(),
        stats.batches_computed(),
        stats.diffs_emitted()
    )
}

// ========================================================================================
//                                     Linear mode
// ========================================================================================

/// Scores and differences the stream on the calling thread in a single pass.
///
/// Unlike the batched run, every adjacent pair is emitted, including pairs that a
/// batched run would split across two batches.
pub fn run_linear<R: Read, W: Write>(
    reader: R,
    sink: W,
) -> Result<PipelineSummary, PipelineError> {
    let start = Instant::now();
    let mut lines = LineReader::new(reader);
    let mut out = BufWriter::new(sink);

    let mut previous: Option<Score> = None;
    let mut line_count: u64 = 0;
    while let Some(score) = lines.next_score().map_err(PipelineError::Read)? {
        if let Some(prev) = previous {
            output::write_pair(&mut out, LineIndex(line_count - 1), prev - score)
                .map_err(PipelineError::Write)?;
        }
        previous = Some(score);
        line_count += 1;
    }
    out.flush().map_err(PipelineError::Write)?;

    let unterminated_bytes = lines.unterminated_bytes();
    if unterminated_bytes > 0 {
        warn!(
            "input ends with {unterminated_bytes} bytes after the last line break; they do not form a line and were ignored"
        );
    }

    Ok(PipelineSummary {
        lines: line_count,
        batches: 0,
        diffs: line_count.saturating_sub(1),
        unterminated_bytes,
        elapsed: start.elapsed(),
    })
}
