//! Build and search parameters, plus the persisted index meta.
//!
//! Everything captured at build time (element type, metric, dimension, K1,
//! block size, bucket sample) is binding for every later operation against
//! the same prefix, so it is written next to the index instead of trusted
//! from the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use silo_distance::{ElementType, Metric};
use silo_error::{ErrorCodes, SiloError};
use thiserror::Error;

use crate::store::{meta_path, BLOCK_COUNT_BYTES, PAGE_SIZE};

fn default_m() -> usize {
    32
}

fn default_ef_construction() -> usize {
    500
}

fn default_k1() -> u32 {
    20
}

fn default_block_size() -> usize {
    PAGE_SIZE
}

fn default_bucket_sample() -> u32 {
    1
}

fn default_nprobe() -> usize {
    16
}

fn default_ef_search() -> usize {
    96
}

fn default_topk() -> i32 {
    20
}

fn default_radius_factor() -> f32 {
    1.0
}

fn default_range_probe_count() -> usize {
    64
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("K1 must be between 1 and 256, got {0}")]
    InvalidK1(u32),
    #[error("block size {0} is not a power of two")]
    MisalignedBlockSize(usize),
    #[error("block size {block_size} cannot hold one dim-{dim} entry")]
    BlockTooSmall { block_size: usize, dim: u32 },
    #[error("{0} quantisation is not implemented")]
    QuantisationUnimplemented(&'static str),
    #[error("metric {metric:?} is unsupported for element type {element:?}")]
    UnsupportedMetric {
        metric: Metric,
        element: ElementType,
    },
    #[error("corpus of {rows} rows cannot seed {k1} coarse clusters")]
    CorpusTooSmall { rows: u32, k1: u32 },
}

impl SiloError for ConfigError {
    fn code(&self) -> ErrorCodes {
        match self {
            ConfigError::QuantisationUnimplemented(_) => ErrorCodes::Unimplemented,
            _ => ErrorCodes::InvalidArgument,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildParams {
    pub data_file: PathBuf,
    pub index_prefix: PathBuf,
    pub element_type: ElementType,
    pub metric: Metric,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_k1")]
    pub k1: u32,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Graph points contributed per bucket: the centroid plus
    /// `bucket_sample - 1` extremal members.
    #[serde(default = "default_bucket_sample")]
    pub bucket_sample: u32,
    #[serde(default)]
    pub vector_use_sq: bool,
    #[serde(default)]
    pub use_hnsw_sq: bool,
}

impl BuildParams {
    pub fn new(
        data_file: impl Into<PathBuf>,
        index_prefix: impl Into<PathBuf>,
        element_type: ElementType,
        metric: Metric,
    ) -> Self {
        BuildParams {
            data_file: data_file.into(),
            index_prefix: index_prefix.into(),
            element_type,
            metric,
            m: default_m(),
            ef_construction: default_ef_construction(),
            k1: default_k1(),
            block_size: default_block_size(),
            bucket_sample: default_bucket_sample(),
            vector_use_sq: false,
            use_hnsw_sq: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k1 == 0 || self.k1 > 256 {
            return Err(ConfigError::InvalidK1(self.k1));
        }
        // Production deployments use k * PAGE_SIZE; any power of two is
        // accepted so small fixtures stay exercisable, with sub-sector
        // blocks served by buffered reads.
        if !self.block_size.is_power_of_two() || self.block_size < 2 * BLOCK_COUNT_BYTES {
            return Err(ConfigError::MisalignedBlockSize(self.block_size));
        }
        if self.vector_use_sq {
            return Err(ConfigError::QuantisationUnimplemented("vector_use_sq"));
        }
        if self.use_hnsw_sq {
            return Err(ConfigError::QuantisationUnimplemented("use_hnsw_sq"));
        }
        if self.metric == Metric::Ip && self.element_type != ElementType::Float32 {
            return Err(ConfigError::UnsupportedMetric {
                metric: self.metric,
                element: self.element_type,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default = "default_nprobe")]
    pub n_probe: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// -1 selects range search.
    #[serde(default = "default_topk")]
    pub topk: i32,
    #[serde(default)]
    pub radius: f32,
    #[serde(default = "default_radius_factor")]
    pub radius_factor: f32,
    #[serde(default = "default_range_probe_count")]
    pub range_search_probe_count: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            n_probe: default_nprobe(),
            ef_search: default_ef_search(),
            topk: default_topk(),
            radius: 0.0,
            radius_factor: default_radius_factor(),
            range_search_probe_count: default_range_probe_count(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("{path}: {source}", path = .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}", path = .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("index was built for {built:?}, requested {requested:?}")]
    ElementMismatch {
        built: ElementType,
        requested: ElementType,
    },
    #[error("index was built with {built:?}, requested {requested:?}")]
    MetricMismatch { built: Metric, requested: Metric },
}

impl SiloError for MetaError {
    fn code(&self) -> ErrorCodes {
        match self {
            MetaError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorCodes::NotFound
            }
            MetaError::Io { .. } => ErrorCodes::Internal,
            MetaError::Format { .. } => ErrorCodes::DataLoss,
            MetaError::ElementMismatch { .. } | MetaError::MetricMismatch { .. } => {
                ErrorCodes::InvalidArgument
            }
        }
    }
}

/// Build-time facts persisted alongside the index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndexMeta {
    pub element_type: ElementType,
    pub metric: Metric,
    pub dim: u32,
    pub k1: u32,
    pub block_size: usize,
    pub bucket_sample: u32,
}

impl IndexMeta {
    pub fn save(&self, prefix: &Path) -> Result<(), MetaError> {
        let path = meta_path(prefix);
        let json = serde_json::to_string_pretty(self).map_err(|source| MetaError::Format {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| MetaError::Io { path, source })
    }

    pub fn load(prefix: &Path) -> Result<Self, MetaError> {
        let path = meta_path(prefix);
        let json =
            std::fs::read_to_string(&path).map_err(|source| MetaError::Io {
                path: path.clone(),
                source,
            })?;
        serde_json::from_str(&json).map_err(|source| MetaError::Format { path, source })
    }
}
