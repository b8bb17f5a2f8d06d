//! Recursive bucket builder.
//!
//! Rewrites each coarse-cluster file from a flat row table into a sequence
//! of fixed-size blocks. A subset that fits one block is emitted directly;
//! anything larger is split with a small K-means and the children processed
//! in ascending order, so `bid` values follow depth-first emission order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use silo_distance::kernels::norm_f32;
use silo_distance::Element;
use silo_error::{ErrorCodes, SiloError};
use thiserror::Error;

use crate::codec::{read_vectors, CodecError, CountingWriter};
use crate::ids::{compose_block_id, MAX_BUCKETS_PER_CLUSTER};
use crate::kmeans::{cluster, KMeansInput};
use crate::store::{block_capacity, cluster_data_path, cluster_ids_path};

const SPLIT_FANOUT: usize = 2;

#[derive(Error, Debug)]
pub enum BucketError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{path}: {source}", path = .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cluster {cid} produced more than {MAX_BUCKETS_PER_CLUSTER} buckets")]
    BucketOverflow { cid: u32 },
    #[error("cluster {cid} holds {rows} rows but {ids} global ids")]
    IdMismatch { cid: u32, rows: u32, ids: u32 },
}

impl SiloError for BucketError {
    fn code(&self) -> ErrorCodes {
        match self {
            BucketError::Codec(err) => err.code(),
            BucketError::Io { .. } => ErrorCodes::Internal,
            BucketError::BucketOverflow { .. } => ErrorCodes::OutOfRange,
            BucketError::IdMismatch { .. } => ErrorCodes::DataLoss,
        }
    }
}

struct ClusterContext<'a, E> {
    cid: u32,
    dim: usize,
    capacity: usize,
    block_size: usize,
    data: &'a [E],
    data_f32: &'a [f32],
    gids: &'a [u32],
    avg_norm: Option<f32>,
    next_bid: u32,
}

/// Sub-clusters every coarse cluster into block-sized buckets, appending
/// each bucket's centroid and packed block id to the shared tables.
/// Returns the total bucket count across all clusters.
pub fn build_buckets<E: Element>(
    prefix: &Path,
    k1: u32,
    dim: usize,
    block_size: usize,
    avg_norm: Option<f32>,
    centroid_writer: &mut CountingWriter,
    combine_writer: &mut CountingWriter,
) -> Result<u32, BucketError> {
    let capacity = block_capacity(block_size, dim, std::mem::size_of::<E>());
    let mut total = 0u32;
    for cid in 0..k1 {
        let data_path = cluster_data_path(prefix, cid);
        let (data, rows, _) = read_vectors::<E>(&data_path)?;
        let (gids, id_rows, _) = read_vectors::<u32>(&cluster_ids_path(prefix, cid))?;
        if rows != id_rows {
            return Err(BucketError::IdMismatch {
                cid,
                rows,
                ids: id_rows,
            });
        }

        let mut writer =
            BufWriter::new(File::create(&data_path).map_err(|source| BucketError::Io {
                path: data_path.clone(),
                source,
            })?);
        if rows == 0 {
            tracing::debug!(cid, "empty coarse cluster");
            continue;
        }

        let data_f32: Vec<f32> = data.iter().map(|v| v.to_f32()).collect();
        let mut ctx = ClusterContext {
            cid,
            dim,
            capacity,
            block_size,
            data: &data,
            data_f32: &data_f32,
            gids: &gids,
            avg_norm,
            next_bid: 0,
        };

        // Depth-first worklist; children pushed in reverse so the lowest
        // child index is emitted first.
        let mut pending: Vec<Vec<u32>> = vec![(0..rows).collect()];
        while let Some(subset) = pending.pop() {
            if subset.len() <= ctx.capacity {
                emit_block(
                    &mut ctx,
                    &subset,
                    &mut writer,
                    &data_path,
                    centroid_writer,
                    combine_writer,
                )?;
                continue;
            }
            for child in split_subset(&ctx, &subset).into_iter().rev() {
                if !child.is_empty() {
                    pending.push(child);
                }
            }
        }

        writer.flush().map_err(|source| BucketError::Io {
            path: data_path.clone(),
            source,
        })?;
        tracing::debug!(cid, buckets = ctx.next_bid, rows, "cluster bucketed");
        total += ctx.next_bid;
    }
    Ok(total)
}

fn split_subset<E>(ctx: &ClusterContext<'_, E>, subset: &[u32]) -> Vec<Vec<u32>> {
    let dim = ctx.dim;
    let mut rows = Vec::with_capacity(subset.len() * dim);
    for &i in subset {
        rows.extend_from_slice(&ctx.data_f32[i as usize * dim..(i as usize + 1) * dim]);
    }
    let out = cluster(&KMeansInput {
        data: &rows,
        dim,
        k: SPLIT_FANOUT,
        avg_norm: ctx.avg_norm,
    });

    let mut children: Vec<Vec<u32>> = vec![Vec::new(); SPLIT_FANOUT];
    for (&row, &assign) in subset.iter().zip(out.assignments.iter()) {
        children[assign as usize].push(row);
    }
    // A split that moved nothing makes no progress; fall back to an even
    // split in row order.
    if children.iter().any(|c| c.len() == subset.len()) {
        let mid = subset.len() / 2;
        children[0] = subset[..mid].to_vec();
        children[1] = subset[mid..].to_vec();
    }
    children
}

fn emit_block<E: Element>(
    ctx: &mut ClusterContext<'_, E>,
    subset: &[u32],
    writer: &mut BufWriter<File>,
    path: &Path,
    centroid_writer: &mut CountingWriter,
    combine_writer: &mut CountingWriter,
) -> Result<(), BucketError> {
    if ctx.next_bid >= MAX_BUCKETS_PER_CLUSTER {
        return Err(BucketError::BucketOverflow { cid: ctx.cid });
    }
    let bid = ctx.next_bid;
    ctx.next_bid += 1;
    let io = |source| BucketError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dim = ctx.dim;
    let mut written = 0usize;
    writer
        .write_all(&(subset.len() as u32).to_le_bytes())
        .map_err(io)?;
    written += 4;
    for &i in subset {
        let row = &ctx.data[i as usize * dim..(i as usize + 1) * dim];
        writer.write_all(bytemuck::cast_slice(row)).map_err(io)?;
        writer
            .write_all(&ctx.gids[i as usize].to_le_bytes())
            .map_err(io)?;
        written += dim * std::mem::size_of::<E>() + 4;
    }
    debug_assert!(written <= ctx.block_size);
    let padding = vec![0u8; ctx.block_size - written];
    writer.write_all(&padding).map_err(io)?;

    let mut centroid = vec![0.0f32; dim];
    for &i in subset {
        for (c, v) in centroid
            .iter_mut()
            .zip(&ctx.data_f32[i as usize * dim..(i as usize + 1) * dim])
        {
            *c += v;
        }
    }
    let inv = 1.0 / subset.len() as f32;
    for c in centroid.iter_mut() {
        *c *= inv;
    }
    if let Some(avg_norm) = ctx.avg_norm {
        let norm = norm_f32(&centroid);
        if norm > 0.0 {
            let factor = avg_norm / norm;
            for c in centroid.iter_mut() {
                *c *= factor;
            }
        }
    }

    centroid_writer.append_row(&centroid)?;
    combine_writer.append_row(&[compose_block_id(ctx.cid, bid)])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_vectors;
    use crate::store::{centroids_path, combine_ids_path, gather_bucket_stats};
    use tempfile::tempdir;

    fn write_cluster(prefix: &Path, cid: u32, rows: &[f32], dim: u32) {
        let n = rows.len() as u32 / dim;
        write_vectors(&cluster_data_path(prefix, cid), rows, n, dim).unwrap();
        let gids: Vec<u32> = (0..n).collect();
        write_vectors(&cluster_ids_path(prefix, cid), &gids, n, 1).unwrap();
    }

    #[test]
    fn small_cluster_becomes_one_exact_block() {
        let dir = tempdir().unwrap();
        let block_size = 128;
        write_cluster(dir.path(), 0, &[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], 2);

        let mut centroid_writer = CountingWriter::create(&centroids_path(dir.path()), 2).unwrap();
        let mut combine_writer = CountingWriter::create(&combine_ids_path(dir.path()), 1).unwrap();
        let total = build_buckets::<f32>(
            dir.path(),
            1,
            2,
            block_size,
            None,
            &mut centroid_writer,
            &mut combine_writer,
        )
        .unwrap();
        centroid_writer.finish().unwrap();
        combine_writer.finish().unwrap();

        assert_eq!(total, 1);
        let file_len = std::fs::metadata(cluster_data_path(dir.path(), 0))
            .unwrap()
            .len();
        assert_eq!(file_len, block_size as u64);

        let (centroids, n, dim) = read_vectors::<f32>(&centroids_path(dir.path())).unwrap();
        assert_eq!((n, dim), (1, 2));
        assert_eq!(centroids, vec![0.5, 0.5]);
        let (combine, _, _) = read_vectors::<u32>(&combine_ids_path(dir.path())).unwrap();
        assert_eq!(combine, vec![compose_block_id(0, 0)]);
    }

    #[test]
    fn oversized_cluster_splits_into_bounded_blocks() {
        let dir = tempdir().unwrap();
        let block_size = 128; // capacity 10 entries at dim 2
        let rows: Vec<f32> = (0..64)
            .flat_map(|i| {
                let base = if i % 2 == 0 { 0.0 } else { 100.0 };
                [base + (i / 2) as f32 * 0.01, base]
            })
            .collect();
        write_cluster(dir.path(), 0, &rows, 2);

        let mut centroid_writer = CountingWriter::create(&centroids_path(dir.path()), 2).unwrap();
        let mut combine_writer = CountingWriter::create(&combine_ids_path(dir.path()), 1).unwrap();
        let total = build_buckets::<f32>(
            dir.path(),
            1,
            2,
            block_size,
            None,
            &mut centroid_writer,
            &mut combine_writer,
        )
        .unwrap();
        centroid_writer.finish().unwrap();
        combine_writer.finish().unwrap();

        assert!(total >= 4);
        let stats = gather_bucket_stats(dir.path(), 1, block_size).unwrap();
        assert_eq!(stats.buckets, total as u64);
        assert_eq!(stats.entries, 64);
        assert!(stats.max_occupancy as usize <= block_capacity(block_size, 2, 4));

        // bids are dense and ascending in emission order.
        let (combine, n, _) = read_vectors::<u32>(&combine_ids_path(dir.path())).unwrap();
        assert_eq!(n, total);
        for (i, &packed) in combine.iter().enumerate() {
            assert_eq!(packed, compose_block_id(0, i as u32));
        }
    }
}
