// ========================================================================================
//                               Run configuration
// ========================================================================================

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lines per batch when nothing else is configured.
pub const DEFAULT_BATCH_CAPACITY: usize = 10_000;
/// Upper bound for the automatically chosen lane count.
pub const MAX_DEFAULT_LANES: usize = 4;
/// Recycled batch buffers kept between the consumer and the producer.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 8;
/// Batches each stage queue holds before its upstream stage has to wait.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("batch capacity must be at least 2 lines, got {0}")]
    BatchCapacity(usize),
    #[error("lane count must be at least 1")]
    NoLanes,
    #[error(
        "{lanes} lanes is more than the {diffs} differences a full batch of {capacity} lines produces"
    )]
    TooManyLanes {
        lanes: usize,
        capacity: usize,
        diffs: usize,
    },
    #[error("buffer pool must hold at least 1 buffer")]
    EmptyBufferPool,
    #[error("queue depth must be at least 1 batch")]
    NoQueueDepth,
}

/// How the differences are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComputeMode {
    /// Producer, lane-parallel compute and consumer stages joined by queues. Pairs that
    /// straddle two batches are not differenced.
    #[default]
    Batched,
    /// One thread, one pass, every adjacent pair including batch boundaries.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub batch_capacity: usize,
    pub lane_count: usize,
    pub buffer_pool_size: usize,
    pub queue_depth: usize,
    pub mode: ComputeMode,
    pub progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            lane_count: default_lane_count(),
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            mode: ComputeMode::default(),
            progress: false,
        }
    }
}

/// One lane per core, up to [`MAX_DEFAULT_LANES`].
pub fn default_lane_count() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_LANES)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    pipeline: PipelineConfig,
}

impl PipelineConfig {
    /// Parses the `[pipeline]` table of a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<ConfigFile>(text).map(|file| file.pipeline)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rejects settings that could only fail once the pipeline is running.
    ///
    /// A full batch of `K` lines yields `K - 1` differences, so more lanes than that
    /// would leave some lanes permanently empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_capacity < 2 {
            return Err(ConfigError::BatchCapacity(self.batch_capacity));
        }
        if self.lane_count == 0 {
            return Err(ConfigError::NoLanes);
        }
        let diffs = self.batch_capacity - 1;
        if self.lane_count > diffs {
            return Err(ConfigError::TooManyLanes {
                lanes: self.lane_count,
                capacity: self.batch_capacity,
                diffs,
            });
        }
        if self.buffer_pool_size == 0 {
            return Err(ConfigError::EmptyBufferPool);
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::NoQueueDepth);
        }
        Ok(())
    }
}
