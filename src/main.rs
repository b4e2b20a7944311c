// ========================================================================================
//
//                          The command-line entry point: scorecard
//
// ========================================================================================
//
// This binary is a thin shell around the library. It parses arguments, merges them
// over an optional config file, sets up logging, picks the output sink, and hands
// everything to `Pipeline`. All scheduling and error semantics live in the library.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::Parser;
use log::info;
use scorecard::{ComputeMode, Pipeline, PipelineConfig};
use std::error::Error;
use std::fs::File;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process;

// ========================================================================================
//                              Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "scorecard",
    version,
    about = "Scores every line of a text file and prints the difference between consecutive line scores."
)]
struct Args {
    /// Path to the text file whose lines are scored.
    #[clap(value_name = "INPUT_PATH")]
    input_path: PathBuf,

    /// Lines per batch. Differences are only taken between lines of the same batch.
    #[clap(long, value_name = "LINES")]
    batch_capacity: Option<usize>,

    /// Number of parallel lanes used to difference each batch.
    #[clap(long, value_name = "LANES")]
    lanes: Option<usize>,

    /// How the differences are computed.
    #[clap(long, value_enum)]
    mode: Option<ComputeMode>,

    /// TOML file with a [pipeline] table. Command-line flags take precedence.
    #[clap(long, value_name = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Write results here instead of standard output.
    #[clap(long, short, value_name = "OUTPUT_PATH")]
    output: Option<PathBuf>,

    /// Never draw the progress spinner, even on a terminal.
    #[clap(long)]
    no_progress: bool,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig, Box<dyn Error + Send + Sync>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(batch_capacity) = self.batch_capacity {
            config.batch_capacity = batch_capacity;
        }
        if let Some(lanes) = self.lanes {
            config.lane_count = lanes;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        // Results on stdout plus a spinner on the same terminal would interleave.
        let stdout_is_terminal = self.output.is_none() && io::stdout().is_terminal();
        config.progress = !self.no_progress && io::stderr().is_terminal() && !stdout_is_terminal;
        Ok(config)
    }
}

// ========================================================================================
//                              The main orchestration logic
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let pipeline = Pipeline::new(args.pipeline_config()?)?;
    let config = pipeline.config();
    info!(
        "> Batch capacity {}, {} lanes, queue depth {}, {:?} mode",
        config.batch_capacity, config.lane_count, config.queue_depth, config.mode
    );

    let sink: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(File::create(path).map_err(|e| {
            format!("failed to create output file '{}': {e}", path.display())
        })?),
        None => Box::new(io::stdout()),
    };

    let summary = pipeline.run_file(&args.input_path, sink)?;
    if summary.unterminated_bytes > 0 {
        info!(
            "> {} trailing bytes without a line break were ignored",
            summary.unterminated_bytes
        );
    }
    Ok(())
}
