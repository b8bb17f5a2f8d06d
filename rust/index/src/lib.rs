//! Disk-resident bucketed ANN index.
//!
//! The corpus lives in fixed-size blocks inside per-cluster files; a small
//! in-memory proximity graph over bucket centroids routes each query to a
//! handful of candidate blocks, which are fetched with direct I/O and
//! scanned exhaustively. `build` writes an immutable index directory;
//! `SiloIndex::load` opens it for knn and range search.

pub mod bucket;
pub mod codec;
pub mod config;
mod fetch;
pub mod graph;
mod heap;
pub mod ids;
pub mod kmeans;
pub mod partition;
pub mod sampler;
pub mod store;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rayon::prelude::*;
use silo_distance::kernels::norm_f32;
use silo_distance::{select_computer, widen, Accum, Computer, Element};
use silo_error::{ErrorCodes, SiloError};
use thiserror::Error;

pub use config::{BuildParams, IndexMeta, SearchParams};
pub use silo_distance::{ElementType, Metric};

use config::{ConfigError, MetaError};
use fetch::{coalesce, fetch_and_scan, RangeSink, TopkSink};
use graph::CentroidGraph;
use heap::FlatHeap;
use ids::{compose_block_id, parse_id};
use store::{BucketStore, graph_path};

/// Share of the corpus reservoir-sampled for coarse clustering.
const TRAIN_SAMPLE_RATE: f64 = 0.01;
const MIN_TRAIN_SAMPLE: usize = 256;
/// Rows inspected for the norm statistics of the sample.
const NORM_STAT_ROWS: usize = 1_000_000;
/// Graph beam configured at load; per-call `ef` widens it per query.
const LOAD_EF_SEARCH: usize = 96;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("query buffer of {len} elements is not a multiple of dim {dim}")]
    QueryShape { len: usize, dim: u32 },
    #[error("topk must be positive")]
    ZeroTopk,
    #[error("nprobe must be positive")]
    ZeroProbe,
}

impl SiloError for SearchError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// Builds an index directory from a raw vector file, dispatching once on
/// the declared element type; everything below is monomorphic.
pub fn build(params: &BuildParams) -> Result<(), Box<dyn SiloError>> {
    match params.element_type {
        ElementType::Float32 => build_typed::<f32>(params),
        ElementType::Int8 => build_typed::<i8>(params),
        ElementType::UInt8 => build_typed::<u8>(params),
    }
}

fn norm_stats(sample: &[f32], dim: usize, rows: usize) -> (f32, f32, f32) {
    let mut max_len = f32::MIN;
    let mut min_len = f32::MAX;
    let mut sum = 0.0f64;
    for row in sample.chunks(dim).take(rows) {
        let len = norm_f32(row);
        max_len = max_len.max(len);
        min_len = min_len.min(len);
        sum += len as f64;
    }
    (max_len, min_len, (sum / rows as f64) as f32)
}

#[tracing::instrument(skip_all, fields(prefix = %params.index_prefix.display()))]
fn build_typed<E: Element>(params: &BuildParams) -> Result<(), Box<dyn SiloError>> {
    params.validate().map_err(|e| e.boxed())?;
    let (rows, dim) = codec::validate_metadata(&params.data_file, std::mem::size_of::<E>())
        .map_err(|e| e.boxed())?;
    if rows < params.k1 {
        return Err(ConfigError::CorpusTooSmall {
            rows,
            k1: params.k1,
        }
        .boxed());
    }
    if store::block_capacity(params.block_size, dim as usize, std::mem::size_of::<E>()) == 0 {
        return Err(ConfigError::BlockTooSmall {
            block_size: params.block_size,
            dim,
        }
        .boxed());
    }
    let prefix = params.index_prefix.as_path();
    std::fs::create_dir_all(prefix).map_err(|e| e.boxed())?;
    tracing::info!(rows, dim, k1 = params.k1, block_size = params.block_size, "build start");

    let sample_rows = ((rows as f64 * TRAIN_SAMPLE_RATE) as usize)
        .max(MIN_TRAIN_SAMPLE)
        .max(params.k1 as usize)
        .min(rows as usize);
    let (sample, sampled) =
        sampler::reservoir_sample::<E>(&params.data_file, sample_rows).map_err(|e| e.boxed())?;
    let sample_f32: Vec<f32> = sample.iter().map(|v| v.to_f32()).collect();
    drop(sample);

    let (max_len, min_len, avg_len) =
        norm_stats(&sample_f32, dim as usize, sampled.min(NORM_STAT_ROWS));
    tracing::info!(sampled, max_len, min_len, avg_len, "sample statistics");
    let avg_norm = (params.metric == Metric::Ip).then_some(avg_len);

    let trained = kmeans::cluster(&kmeans::KMeansInput {
        data: &sample_f32,
        dim: dim as usize,
        k: params.k1 as usize,
        avg_norm,
    });
    drop(sample_f32);
    tracing::info!(k1 = params.k1, "coarse centroids trained");

    partition::partition_corpus::<E>(
        &params.data_file,
        prefix,
        &trained.centroids,
        params.k1 as usize,
    )
    .map_err(|e| e.boxed())?;

    let mut centroid_writer =
        codec::CountingWriter::create(&store::centroids_path(prefix), dim).map_err(|e| e.boxed())?;
    let mut combine_writer =
        codec::CountingWriter::create(&store::combine_ids_path(prefix), 1).map_err(|e| e.boxed())?;
    let buckets = bucket::build_buckets::<E>(
        prefix,
        params.k1,
        dim as usize,
        params.block_size,
        avg_norm,
        &mut centroid_writer,
        &mut combine_writer,
    )
    .map_err(|e| e.boxed())?;
    centroid_writer.finish().map_err(|e| e.boxed())?;
    combine_writer.finish().map_err(|e| e.boxed())?;
    tracing::info!(buckets, "buckets written");

    graph::build_centroid_graph::<E>(
        prefix,
        params.metric,
        params.m,
        params.ef_construction,
        params.block_size,
        params.bucket_sample,
    )?;

    IndexMeta {
        element_type: E::TYPE,
        metric: params.metric,
        dim,
        k1: params.k1,
        block_size: params.block_size,
        bucket_sample: params.bucket_sample,
    }
    .save(prefix)
    .map_err(|e| e.boxed())?;

    store::gather_bucket_stats(prefix, params.k1, params.block_size).map_err(|e| e.boxed())?;
    tracing::info!("build complete");
    Ok(())
}

/// Read-only handle over one index directory.
pub struct SiloIndex<E: Element> {
    meta: IndexMeta,
    prefix: PathBuf,
    graph: CentroidGraph,
    computer: Computer<E>,
}

/// Either result shape, for callers driving searches from `SearchParams`.
pub enum SearchResult<A> {
    Knn {
        ids: Vec<u32>,
        dists: Vec<A>,
    },
    Range {
        ids: Vec<u32>,
        dists: Vec<A>,
        limits: Vec<usize>,
    },
}

impl<E: Element> SiloIndex<E> {
    #[tracing::instrument(name = "SiloIndex load", skip_all, fields(prefix = %prefix.display()))]
    pub fn load(prefix: &Path, metric: Metric) -> Result<Self, Box<dyn SiloError>> {
        let meta = IndexMeta::load(prefix).map_err(|e| e.boxed())?;
        if meta.element_type != E::TYPE {
            return Err(MetaError::ElementMismatch {
                built: meta.element_type,
                requested: E::TYPE,
            }
            .boxed());
        }
        if meta.metric != metric {
            return Err(MetaError::MetricMismatch {
                built: meta.metric,
                requested: metric,
            }
            .boxed());
        }
        let computer = select_computer::<E>(metric).map_err(|e| e.boxed())?;
        let graph = CentroidGraph::load(
            &graph_path(prefix),
            metric,
            meta.dim as usize,
            LOAD_EF_SEARCH,
        )?;
        Ok(SiloIndex {
            meta,
            prefix: prefix.to_path_buf(),
            graph,
            computer,
        })
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    /// Points held by the proximity graph (centroids plus extremal samples).
    pub fn graph_len(&self) -> usize {
        self.graph.len()
    }

    fn query_count(&self, queries: &[E]) -> Result<usize, Box<dyn SiloError>> {
        let dim = self.meta.dim as usize;
        if dim == 0 || queries.is_empty() || queries.len() % dim != 0 {
            return Err(SearchError::QueryShape {
                len: queries.len(),
                dim: self.meta.dim,
            }
            .boxed());
        }
        Ok(queries.len() / dim)
    }

    /// Graph probe: `nprobe` block labels per query, searched with a beam
    /// of at least `ef`.
    fn probe(
        &self,
        queries: &[E],
        nq: usize,
        nprobe: usize,
        ef: usize,
    ) -> Result<Vec<Vec<u32>>, Box<dyn SiloError>> {
        let dim = self.meta.dim as usize;
        (0..nq)
            .into_par_iter()
            .map(|i| -> Result<Vec<u32>, Box<dyn SiloError>> {
                let query = widen(&queries[i * dim..(i + 1) * dim]);
                let labels = self.graph.probe(&query, nprobe.max(ef))?;
                Ok(labels
                    .into_iter()
                    .take(nprobe)
                    .map(|label| {
                        let (cid, bid, _) = parse_id(label);
                        compose_block_id(cid, bid)
                    })
                    .collect())
            })
            .collect()
    }

    /// K-nearest-neighbor search over a query batch. Returns `nq * topk`
    /// ids and distances, each query's slice in ascending stored-distance
    /// order; unfilled slots carry sentinel ids.
    pub fn knn(
        &self,
        queries: &[E],
        topk: usize,
        nprobe: usize,
        ef: usize,
    ) -> Result<(Vec<u32>, Vec<E::Acc>), Box<dyn SiloError>> {
        let nq = self.query_count(queries)?;
        if topk == 0 {
            return Err(SearchError::ZeroTopk.boxed());
        }
        if nprobe == 0 {
            return Err(SearchError::ZeroProbe.boxed());
        }

        let labels = self.probe(queries, nq, nprobe, ef)?;
        let batch = coalesce(&labels);
        let sink = TopkSink {
            heaps: (0..nq)
                .into_par_iter()
                .map(|_| Mutex::new(FlatHeap::<E::Acc>::new(topk)))
                .collect(),
        };
        let mut bucket_store = BucketStore::open(&self.prefix, self.meta.block_size);
        fetch_and_scan::<E, _>(
            &mut bucket_store,
            queries,
            self.meta.dim as usize,
            &batch,
            self.computer,
            &sink,
        );

        let negate = self.meta.metric == Metric::Ip;
        let mut ids = Vec::with_capacity(nq * topk);
        let mut dists = Vec::with_capacity(nq * topk);
        for heap in sink.heaps {
            let (heap_dists, heap_ids) = heap.into_inner().into_sorted();
            ids.extend(heap_ids);
            dists.extend(
                heap_dists
                    .into_iter()
                    .map(|d| if negate { d.negated() } else { d }),
            );
        }
        Ok((ids, dists))
    }

    /// Range search: every stored distance within `radius * radius_factor`,
    /// as a CSR triple `(ids, dists, limits)` with `limits.len() == nq + 1`.
    pub fn range_search(
        &self,
        queries: &[E],
        radius: f32,
        radius_factor: f32,
        probe_count: usize,
    ) -> Result<(Vec<u32>, Vec<E::Acc>, Vec<usize>), Box<dyn SiloError>> {
        let nq = self.query_count(queries)?;
        if probe_count == 0 {
            return Err(SearchError::ZeroProbe.boxed());
        }

        let labels = self.probe(queries, nq, probe_count, probe_count)?;
        let batch = coalesce(&labels);
        let sink = RangeSink::<E::Acc> {
            rows: (0..nq).map(|_| Mutex::new(Vec::new())).collect(),
            threshold: radius * radius_factor,
        };
        let mut bucket_store = BucketStore::open(&self.prefix, self.meta.block_size);
        fetch_and_scan::<E, _>(
            &mut bucket_store,
            queries,
            self.meta.dim as usize,
            &batch,
            self.computer,
            &sink,
        );

        let negate = self.meta.metric == Metric::Ip;
        let mut ids = Vec::new();
        let mut dists = Vec::new();
        let mut limits = Vec::with_capacity(nq + 1);
        limits.push(0);
        for row in sink.rows {
            let mut row = row.into_inner();
            row.sort_unstable_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            for (dist, id) in row {
                ids.push(id);
                dists.push(if negate { dist.negated() } else { dist });
            }
            limits.push(ids.len());
        }
        Ok((ids, dists, limits))
    }

    /// Parameter-driven entry point: `topk == -1` selects range search.
    pub fn search(
        &self,
        queries: &[E],
        params: &SearchParams,
    ) -> Result<SearchResult<E::Acc>, Box<dyn SiloError>> {
        if params.topk == -1 {
            let (ids, dists, limits) = self.range_search(
                queries,
                params.radius,
                params.radius_factor,
                params.range_search_probe_count,
            )?;
            Ok(SearchResult::Range { ids, dists, limits })
        } else {
            let (ids, dists) = self.knn(
                queries,
                params.topk.max(1) as usize,
                params.n_probe,
                params.ef_search,
            )?;
            Ok(SearchResult::Knn { ids, dists })
        }
    }
}

pub use heap::SENTINEL_ID;
