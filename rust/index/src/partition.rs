//! Coarse partition of the raw corpus.
//!
//! Streams the corpus in fixed-size row batches, assigns each row to its
//! nearest coarse centroid, and appends `(vector, global_id)` to the
//! per-cluster writers. Row-count headers are backpatched when the stream
//! ends.

use std::path::Path;

use bytemuck::Zeroable;
use silo_distance::Element;

use crate::codec::{CodecError, CountingWriter, VectorReader};
use crate::kmeans::elkan_assign;
use crate::store::{cluster_data_path, cluster_ids_path};

const BATCH_ROWS: usize = 1 << 18;

pub fn partition_corpus<E: Element>(
    data_file: &Path,
    prefix: &Path,
    centroids: &[f32],
    k1: usize,
) -> Result<Vec<u32>, CodecError> {
    let mut reader = VectorReader::<E>::open(data_file)?;
    let dim = reader.dim() as usize;
    debug_assert_eq!(centroids.len(), k1 * dim);

    let mut data_writers = Vec::with_capacity(k1);
    let mut ids_writers = Vec::with_capacity(k1);
    for cid in 0..k1 as u32 {
        data_writers.push(CountingWriter::create(
            &cluster_data_path(prefix, cid),
            dim as u32,
        )?);
        ids_writers.push(CountingWriter::create(&cluster_ids_path(prefix, cid), 1)?);
    }

    let batch_rows = BATCH_ROWS.min(reader.rows() as usize).max(1);
    let mut batch = vec![E::zeroed(); batch_rows * dim];
    let mut batch_f32 = vec![0.0f32; batch_rows * dim];
    let mut assignments = vec![0u32; batch_rows];
    let mut dists = vec![0.0f32; batch_rows];

    let mut next_gid = 0u32;
    loop {
        let rows = reader.read_rows(&mut batch, batch_rows)?;
        if rows == 0 {
            break;
        }
        for (src, dst) in batch[..rows * dim].iter().zip(batch_f32.iter_mut()) {
            *dst = src.to_f32();
        }
        elkan_assign(
            &batch_f32[..rows * dim],
            dim,
            centroids,
            k1,
            &mut assignments[..rows],
            &mut dists[..rows],
        );
        for (row, &cid) in batch[..rows * dim].chunks(dim).zip(assignments.iter()) {
            data_writers[cid as usize].append_row(row)?;
            ids_writers[cid as usize].append_row(&[next_gid])?;
            next_gid += 1;
        }
        tracing::debug!(rows, next_gid, "partitioned batch");
    }

    let mut sizes = Vec::with_capacity(k1);
    for (data_writer, ids_writer) in data_writers.into_iter().zip(ids_writers) {
        let rows = data_writer.finish()?;
        let id_rows = ids_writer.finish()?;
        debug_assert_eq!(rows, id_rows);
        sizes.push(rows);
    }
    tracing::info!(total = next_gid, clusters = k1, "partition complete");
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_vectors, write_vectors};
    use tempfile::tempdir;

    #[test]
    fn rows_land_with_their_nearest_centroid() {
        let dir = tempdir().unwrap();
        let data_file = dir.path().join("corpus.bin");
        let data = vec![
            0.0f32, 0.0, 0.0, 1.0, 10.0, 10.0, 11.0, 11.0, 0.5, 0.5, 10.5, 10.5,
        ];
        write_vectors(&data_file, &data, 6, 2).unwrap();
        let centroids = vec![0.0f32, 0.0, 10.0, 10.0];

        let sizes = partition_corpus::<f32>(&data_file, dir.path(), &centroids, 2).unwrap();
        assert_eq!(sizes, vec![3, 3]);

        let (ids0, n0, _) = read_vectors::<u32>(&cluster_ids_path(dir.path(), 0)).unwrap();
        let (ids1, n1, _) = read_vectors::<u32>(&cluster_ids_path(dir.path(), 1)).unwrap();
        assert_eq!((n0, n1), (3, 3));
        assert_eq!(ids0, vec![0, 1, 4]);
        assert_eq!(ids1, vec![2, 3, 5]);

        let (rows0, _, dim) = read_vectors::<f32>(&cluster_data_path(dir.path(), 0)).unwrap();
        assert_eq!(dim, 2);
        assert_eq!(rows0, vec![0.0, 0.0, 0.0, 1.0, 0.5, 0.5]);
    }
}
