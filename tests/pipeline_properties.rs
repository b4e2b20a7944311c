// ========================================================================================
//
//                  Property tests for the queues, the lane kernel and full runs
//
// ========================================================================================
//
// Every batched run is checked against a reference built the slow way: score each line
// directly, cut the scores into batches of the configured capacity, and difference
// only within a batch.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scorecard::kernel::{LaneExecutor, diff_in_place};
use scorecard::queue::ThreadSafeQueue;
use scorecard::{ComputeMode, Pipeline, PipelineConfig, PipelineSummary, Score};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

// --- Helpers ---

fn line_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..12).prop_map(|mut bytes| {
        for byte in &mut bytes {
            if *byte == b'\n' {
                *byte = b'x';
            }
        }
        bytes
    })
}

fn join_lines(lines: &[Vec<u8>]) -> Vec<u8> {
    let mut input = Vec::new();
    for line in lines {
        input.extend_from_slice(line);
        input.push(b'\n');
    }
    input
}

fn reference_scores(lines: &[Vec<u8>]) -> Vec<Score> {
    lines
        .iter()
        .map(|line| line.iter().map(|&b| Score::from(b)).sum())
        .collect()
}

fn reference_batched(scores: &[Score], capacity: usize) -> String {
    let mut expected = String::new();
    for (batch, chunk) in scores.chunks(capacity).enumerate() {
        let start = batch * capacity;
        for (i, pair) in chunk.windows(2).enumerate() {
            let first = start + i;
            writeln!(expected, "{}-{}: {}", first, first + 1, pair[0] - pair[1])
                .expect("write to string");
        }
    }
    expected
}

fn reference_linear(scores: &[Score]) -> String {
    let mut expected = String::new();
    for (i, pair) in scores.windows(2).enumerate() {
        writeln!(expected, "{}-{}: {}", i, i + 1, pair[0] - pair[1]).expect("write to string");
    }
    expected
}

fn config(batch_capacity: usize, lane_count: usize, mode: ComputeMode) -> PipelineConfig {
    PipelineConfig {
        batch_capacity,
        lane_count,
        mode,
        ..PipelineConfig::default()
    }
}

fn run(config: PipelineConfig, input: Vec<u8>) -> (String, PipelineSummary) {
    let pipeline = Pipeline::new(config).expect("valid config");
    let mut out = Vec::new();
    let summary = pipeline
        .run(Cursor::new(input), &mut out)
        .expect("run succeeds");
    (String::from_utf8(out).expect("utf8 output"), summary)
}

#[derive(Debug, Clone)]
enum QueueOp {
    Push(u32),
    Pop,
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![any::<u32>().prop_map(QueueOp::Push), Just(QueueOp::Pop)]
}

// --- Properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn queue_behaves_like_a_fifo(ops in prop::collection::vec(queue_op(), 0..200)) {
        // Deep enough that no push in the sequence has to wait.
        let (sender, queue) = ThreadSafeQueue::bounded(ops.len().max(1));
        let mut model = VecDeque::new();
        for op in ops {
            match op {
                QueueOp::Push(value) => {
                    prop_assert!(sender.push(value).is_ok());
                    model.push_back(value);
                }
                QueueOp::Pop => prop_assert_eq!(queue.pop(), model.pop_front()),
            }
            prop_assert_eq!(queue.len(), model.len());
        }
    }

    #[test]
    fn concurrent_push_and_pop_keep_push_order(
        items in prop::collection::vec(any::<u32>(), 0..500),
        depth in 1usize..8,
        seed in any::<u64>(),
    ) {
        let (sender, queue) = ThreadSafeQueue::bounded(depth);
        let received = thread::scope(|s| {
            let items = &items;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for &item in items {
                    sender.push(item).expect("receiver alive");
                    if rng.gen_bool(0.1) {
                        thread::yield_now();
                    }
                }
                sender.finish();
            });
            let mut received = Vec::with_capacity(items.len());
            while let Some(item) = queue.pop_wait() {
                received.push(item);
            }
            received
        });
        prop_assert_eq!(received, items);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn every_lane_count_matches_the_serial_transform(
        scores in prop::collection::vec(-1_000_000i64..1_000_000, 0..300),
        lanes in 1usize..9,
    ) {
        let executor = LaneExecutor::new(lanes).expect("lane pool");
        let mut parallel = scores.clone();
        let mut serial = scores;
        let parallel_len = executor.transform(&mut parallel);
        let serial_len = diff_in_place(&mut serial);
        prop_assert_eq!(parallel_len, serial_len);
        prop_assert_eq!(&parallel[..parallel_len], &serial[..serial_len]);
    }

    #[test]
    fn batched_run_differences_within_batches_in_order(
        lines in prop::collection::vec(line_strategy(), 0..80),
        capacity in 2usize..20,
        lanes in 1usize..5,
    ) {
        let lanes = lanes.min(capacity - 1);
        let scores = reference_scores(&lines);
        let (out, summary) = run(config(capacity, lanes, ComputeMode::Batched), join_lines(&lines));

        prop_assert_eq!(out, reference_batched(&scores, capacity));
        prop_assert_eq!(summary.lines, lines.len() as u64);
        prop_assert_eq!(summary.batches, lines.len().div_ceil(capacity) as u64);
        prop_assert_eq!(summary.unterminated_bytes, 0);
    }

    #[test]
    fn linear_run_differences_every_pair(
        lines in prop::collection::vec(line_strategy(), 0..80),
        capacity in 2usize..20,
    ) {
        let scores = reference_scores(&lines);
        let (out, summary) = run(config(capacity, 1, ComputeMode::Linear), join_lines(&lines));

        prop_assert_eq!(out, reference_linear(&scores));
        prop_assert_eq!(summary.diffs, scores.len().saturating_sub(1) as u64);
    }

    #[test]
    fn input_that_fits_one_batch_is_the_same_in_both_modes(
        lines in prop::collection::vec(line_strategy(), 0..30),
        lanes in 1usize..5,
    ) {
        let input = join_lines(&lines);
        let (batched, _) = run(config(32, lanes, ComputeMode::Batched), input.clone());
        let (linear, _) = run(config(32, lanes, ComputeMode::Linear), input);
        prop_assert_eq!(batched, linear);
    }
}

// --- Targeted cases ---

#[test]
fn pushes_from_another_thread_arrive_in_order() {
    let (sender, queue) = ThreadSafeQueue::bounded(16);
    let received = thread::scope(|s| {
        s.spawn(move || {
            for i in 0..10_000u32 {
                sender.push(i).expect("receiver alive");
            }
            sender.finish();
        });
        let mut received = Vec::new();
        while let Some(item) = queue.pop_wait() {
            received.push(item);
        }
        received
    });
    assert_eq!(received, (0..10_000).collect::<Vec<_>>());
    assert!(queue.is_finished());
}

#[test]
fn two_full_batches_and_one_line_make_three_batches() {
    let capacity = 5;
    let lines: Vec<Vec<u8>> = (0..2 * capacity + 1)
        .map(|i| format!("line {i}").into_bytes())
        .collect();
    let scores = reference_scores(&lines);

    let (out, summary) = run(config(capacity, 2, ComputeMode::Batched), join_lines(&lines));

    assert_eq!(summary.lines, 11);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.diffs, 2 * (capacity as u64 - 1));
    assert_eq!(out, reference_batched(&scores, capacity));
    assert!(!out.contains("4-5:"), "pair across the first boundary was emitted");
    assert!(!out.contains("9-10:"), "pair across the second boundary was emitted");
}

#[test]
fn large_random_input_terminates_with_every_expected_line() {
    let mut rng = StdRng::seed_from_u64(0x5c04_ecad);
    let lines: Vec<Vec<u8>> = (0..25_000)
        .map(|_| {
            let len = rng.gen_range(0..40);
            (0..len).map(|_| rng.gen_range(b' '..=b'~')).collect()
        })
        .collect();
    let scores = reference_scores(&lines);

    for lanes in [1, 3, 4] {
        let (out, summary) = run(config(1_000, lanes, ComputeMode::Batched), join_lines(&lines));
        assert_eq!(summary.lines, 25_000);
        assert_eq!(summary.batches, 25);
        assert_eq!(summary.diffs, 25 * 999);
        assert_eq!(out, reference_batched(&scores, 1_000));
    }
}

#[test]
fn trailing_bytes_without_a_terminator_are_not_a_line() {
    let (out, summary) = run(config(10, 2, ComputeMode::Batched), b"ab\nc\ndangling".to_vec());
    assert_eq!(out, "0-1: 96\n");
    assert_eq!(summary.lines, 2);
    assert_eq!(summary.unterminated_bytes, 8);
}

// Serves at most 64 bytes per read and counts the lines it has handed out.
struct CountingReader {
    input: Cursor<Vec<u8>>,
    lines_read: Arc<AtomicU64>,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = buf.len().min(64);
        let n = self.input.read(&mut buf[..limit])?;
        let lines = buf[..n].iter().filter(|&&b| b == b'\n').count();
        self.lines_read.fetch_add(lines as u64, Ordering::SeqCst);
        Ok(n)
    }
}

// A slow sink that records how far the reader got ahead of it.
struct SlowSink {
    lines_read: Arc<AtomicU64>,
    lines_written: u64,
    max_lead: Arc<AtomicU64>,
}

impl Write for SlowSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(1));
        self.lines_written += buf.iter().filter(|&&b| b == b'\n').count() as u64;
        let lead = self
            .lines_read
            .load(Ordering::SeqCst)
            .saturating_sub(self.lines_written);
        self.max_lead.fetch_max(lead, Ordering::SeqCst);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn a_slow_sink_holds_back_the_reader() {
    let lines_read = Arc::new(AtomicU64::new(0));
    let max_lead = Arc::new(AtomicU64::new(0));
    let reader = CountingReader {
        input: Cursor::new(b"7\n".repeat(200_000)),
        lines_read: Arc::clone(&lines_read),
    };
    let sink = SlowSink {
        lines_read: Arc::clone(&lines_read),
        lines_written: 0,
        max_lead: Arc::clone(&max_lead),
    };
    let pipeline = Pipeline::new(PipelineConfig {
        queue_depth: 1,
        ..config(1_000, 2, ComputeMode::Batched)
    })
    .expect("valid config");

    let summary = pipeline.run(reader, sink).expect("run succeeds");

    assert_eq!(summary.lines, 200_000);
    assert_eq!(summary.diffs, 200 * 999);
    // A handful of batches may be in flight between the stages, never the whole input.
    let lead = max_lead.load(Ordering::SeqCst);
    assert!(lead <= 10_000, "reader ran {lead} lines ahead of the sink");
}
