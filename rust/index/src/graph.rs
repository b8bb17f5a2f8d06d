//! In-memory proximity graph over bucket centroids.
//!
//! The graph itself is the `hnswlib` dependency; this module wraps it the
//! same way the index wraps any external index structure (typed config in,
//! wrapped errors out) and populates it from the bucket tables. Each
//! centroid is inserted under its composite id with offset 0; when
//! `bucket_sample > 1` each bucket also contributes extremal members so a
//! query landing near a bucket boundary can still route to it.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use rayon::prelude::*;
use silo_distance::kernels::distance_f32;
use silo_distance::{widen, Element, Metric};
use silo_error::{ErrorCodes, SiloError};
use thiserror::Error;

use crate::codec::read_vectors;
use crate::ids::{compose_id, parse_block_id};
use crate::store::{
    centroids_path, cluster_data_path, combine_ids_path, graph_path, AlignedBuf,
};

const BUILD_EF_SEARCH: usize = 16;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct WrappedGraphError(#[from] hnswlib::HnswError);

impl SiloError for WrappedGraphError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

#[derive(Error, Debug)]
pub enum GraphInitError {
    #[error("Graph path is not valid UTF-8")]
    BadPath,
    #[error("{path}: {source}", path = .path.display())]
    Storage {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Init(#[from] hnswlib::HnswInitError),
}

impl SiloError for GraphInitError {
    fn code(&self) -> ErrorCodes {
        match self {
            GraphInitError::BadPath => ErrorCodes::InvalidArgument,
            GraphInitError::Storage { .. } => ErrorCodes::Internal,
            GraphInitError::Init(_) => ErrorCodes::Internal,
        }
    }
}

fn map_metric(metric: Metric) -> hnswlib::HnswDistanceFunction {
    match metric {
        Metric::L2 => hnswlib::HnswDistanceFunction::Euclidean,
        Metric::Ip => hnswlib::HnswDistanceFunction::InnerProduct,
    }
}

pub struct CentroidGraph {
    index: hnswlib::HnswIndex,
    pub metric: Metric,
}

impl CentroidGraph {
    pub fn create(
        persist_path: &Path,
        metric: Metric,
        dim: usize,
        max_elements: usize,
        m: usize,
        ef_construction: usize,
    ) -> Result<Self, Box<dyn SiloError>> {
        // The graph library persists into a directory of its own files.
        std::fs::create_dir_all(persist_path).map_err(|source| {
            GraphInitError::Storage {
                path: persist_path.to_path_buf(),
                source,
            }
            .boxed()
        })?;
        let persist_path = persist_path
            .to_str()
            .ok_or_else(|| GraphInitError::BadPath.boxed())?
            .to_string();
        let index = hnswlib::HnswIndex::init(hnswlib::HnswIndexInitConfig {
            distance_function: map_metric(metric),
            dimensionality: dim as i32,
            max_elements,
            m,
            ef_construction,
            ef_search: BUILD_EF_SEARCH,
            random_seed: 0,
            persist_path: Some(persist_path.as_str().into()),
        })
        .map_err(|e| GraphInitError::Init(e).boxed())?;
        Ok(CentroidGraph { index, metric })
    }

    pub fn load(
        persist_path: &Path,
        metric: Metric,
        dim: usize,
        ef_search: usize,
    ) -> Result<Self, Box<dyn SiloError>> {
        let persist_path = persist_path
            .to_str()
            .ok_or_else(|| GraphInitError::BadPath.boxed())?;
        let index = hnswlib::HnswIndex::load(hnswlib::HnswIndexLoadConfig {
            distance_function: map_metric(metric),
            dimensionality: dim as i32,
            persist_path: persist_path.into(),
            ef_search,
        })
        .map_err(|e| GraphInitError::Init(e).boxed())?;
        Ok(CentroidGraph { index, metric })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn add(&self, label: u64, vector: &[f32]) -> Result<(), Box<dyn SiloError>> {
        self.index
            .add(label as usize, vector)
            .map_err(|e| WrappedGraphError(e).boxed())
    }

    /// Returns up to `k` composite labels, nearest first. The graph's beam
    /// is `max(ef_search, k)`, so callers widen `k` to realize a larger
    /// search-time beam and truncate afterwards.
    pub fn probe(&self, query: &[f32], k: usize) -> Result<Vec<u64>, Box<dyn SiloError>> {
        let k = k.min(self.len());
        let (labels, _dists) = self
            .index
            .query(query, k, &[], &[])
            .map_err(|e| WrappedGraphError(e).boxed())?;
        Ok(labels.into_iter().map(|l| l as u64).collect())
    }

    pub fn save(&self) -> Result<(), Box<dyn SiloError>> {
        self.index.save().map_err(|e| WrappedGraphError(e).boxed())
    }
}

#[derive(Error, Debug)]
pub enum GraphBuildError {
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error("centroid table holds {centroids} rows but combine-ids holds {ids}")]
    TableMismatch { centroids: u32, ids: u32 },
    #[error("{path}: {source}", path = .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SiloError for GraphBuildError {
    fn code(&self) -> ErrorCodes {
        match self {
            GraphBuildError::Codec(err) => err.code(),
            GraphBuildError::TableMismatch { .. } => ErrorCodes::DataLoss,
            GraphBuildError::Io { .. } => ErrorCodes::Internal,
        }
    }
}

/// Builds and persists the proximity graph for a finished bucket layout.
pub fn build_centroid_graph<E: Element>(
    prefix: &Path,
    metric: Metric,
    m: usize,
    ef_construction: usize,
    block_size: usize,
    bucket_sample: u32,
) -> Result<CentroidGraph, Box<dyn SiloError>> {
    let (centroids, nblocks, dim) = read_vectors::<f32>(&centroids_path(prefix))
        .map_err(|e| GraphBuildError::Codec(e).boxed())?;
    let (block_ids, nids, _) = read_vectors::<u32>(&combine_ids_path(prefix))
        .map_err(|e| GraphBuildError::Codec(e).boxed())?;
    if nblocks != nids {
        return Err(GraphBuildError::TableMismatch {
            centroids: nblocks,
            ids: nids,
        }
        .boxed());
    }
    let dim = dim as usize;
    let sample = bucket_sample.max(1) as usize;

    let graph = CentroidGraph::create(
        &graph_path(prefix),
        metric,
        dim,
        sample * nblocks as usize,
        m,
        ef_construction,
    )?;

    // One read-only descriptor per cluster file, shared by the insert tasks.
    let mut cluster_files: HashMap<u32, File> = HashMap::new();
    if sample > 1 {
        for &packed in &block_ids {
            let (cid, _) = parse_block_id(packed);
            if !cluster_files.contains_key(&cid) {
                let path = cluster_data_path(prefix, cid);
                let file = File::open(&path)
                    .map_err(|source| GraphBuildError::Io { path, source }.boxed())?;
                cluster_files.insert(cid, file);
            }
        }
    }

    (0..nblocks as usize)
        .into_par_iter()
        .try_for_each(|row| -> Result<(), Box<dyn SiloError>> {
            let (cid, bid) = parse_block_id(block_ids[row]);
            let centroid = &centroids[row * dim..(row + 1) * dim];
            graph.add(compose_id(cid, bid, 0), centroid)?;
            if sample > 1 {
                add_extremal_samples::<E>(
                    &graph,
                    &cluster_files[&cid],
                    prefix,
                    cid,
                    bid,
                    centroid,
                    metric,
                    dim,
                    block_size,
                    sample - 1,
                )?;
            }
            Ok(())
        })?;

    tracing::info!(
        buckets = nblocks,
        points = graph.len(),
        sample,
        "proximity graph built"
    );
    graph.save()?;
    Ok(graph)
}

#[allow(clippy::too_many_arguments)]
fn add_extremal_samples<E: Element>(
    graph: &CentroidGraph,
    file: &File,
    prefix: &Path,
    cid: u32,
    bid: u32,
    centroid: &[f32],
    metric: Metric,
    dim: usize,
    block_size: usize,
    count: usize,
) -> Result<(), Box<dyn SiloError>> {
    let mut block = AlignedBuf::alloc(block_size);
    file.read_exact_at(&mut block, bid as u64 * block_size as u64)
        .map_err(|source| {
            GraphBuildError::Io {
                path: cluster_data_path(prefix, cid),
                source,
            }
            .boxed()
        })?;

    let entry_num = u32::from_le_bytes(block[..4].try_into().unwrap()) as usize;
    let vec_size = dim * std::mem::size_of::<E>();
    let entry_size = vec_size + 4;
    let entries = &block[4..];

    let mut dists = Vec::with_capacity(entry_num);
    for k in 0..entry_num {
        let vector: &[E] = bytemuck::cast_slice(&entries[k * entry_size..][..vec_size]);
        dists.push(distance_f32(metric, &widen(vector), centroid));
    }

    // `dists` is in the ascending-is-nearer domain (IP values arrive
    // negated), so the largest stored value is the member furthest from
    // the centroid under either metric: the boundary points the graph
    // needs for routing.
    for (j, k) in select_extremal(&dists, count).into_iter().enumerate() {
        let vector: &[E] = bytemuck::cast_slice(&entries[k * entry_size..][..vec_size]);
        graph.add(compose_id(cid, bid, (j + 1) as u32), &widen(vector))?;
    }
    Ok(())
}

/// Greedy selection without replacement of the `count` largest distances.
/// Strict comparison keeps the smaller index on ties.
fn select_extremal(dists: &[f32], count: usize) -> Vec<usize> {
    let mut picked = vec![false; dists.len()];
    let mut picks = Vec::with_capacity(count.min(dists.len()));
    for _ in 0..count.min(dists.len()) {
        let mut best: Option<usize> = None;
        for (k, &d) in dists.iter().enumerate() {
            if picked[k] {
                continue;
            }
            best = match best {
                None => Some(k),
                Some(b) if d > dists[b] => Some(k),
                Some(b) => Some(b),
            };
        }
        let Some(k) = best else { break };
        picked[k] = true;
        picks.push(k);
    }
    picks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremal_selection_takes_largest_first() {
        // L2 domain: plain squared distances, boundary = largest.
        assert_eq!(select_extremal(&[0.5, 4.0, 1.0, 9.0], 2), vec![3, 1]);
    }

    #[test]
    fn extremal_selection_handles_negated_ip_domain() {
        // Negated inner products for raw scores [5, 1, 3]: the least
        // similar member (raw 1, stored -1) must come out first.
        assert_eq!(select_extremal(&[-5.0, -1.0, -3.0], 2), vec![1, 2]);
    }

    #[test]
    fn extremal_selection_ties_keep_the_smaller_index() {
        assert_eq!(select_extremal(&[2.0, 2.0, 2.0], 2), vec![0, 1]);
    }

    #[test]
    fn extremal_selection_truncates_at_member_count() {
        assert_eq!(select_extremal(&[1.0, 2.0], 5), vec![1, 0]);
    }
}
