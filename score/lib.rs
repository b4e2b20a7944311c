#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
//! Line scores and their adjacent differences, computed by a three-stage pipeline.
//!
//! A producer thread scores each line of a byte stream and groups the scores into
//! fixed-capacity batches. A compute thread differences each batch across a pool of
//! lane threads. A consumer thread writes `i-(i+1): diff` lines in input order.
pub mod config;
pub mod io;
pub mod kernel;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod types;

pub use config::{ComputeMode, ConfigError, PipelineConfig};
pub use pipeline::{Pipeline, PipelineError};
pub use types::{LineIndex, PipelineSummary, Score};
