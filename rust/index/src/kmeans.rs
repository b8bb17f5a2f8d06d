//! Flat K-means with Elkan-style pruning.
//!
//! The assignment phase skips a centroid whenever the current best squared
//! distance is already within a quarter of the squared distance between the
//! best centroid and the candidate (triangle inequality in the squared
//! domain). The update phase averages assigned rows and, when an average
//! norm is supplied, rescales each centroid to that length for
//! inner-product clustering.

use rayon::prelude::*;
use silo_distance::kernels::{l2_sqr_f32, norm_f32};

const MAX_ITERATIONS: usize = 10;
const RELATIVE_SHIFT_EXIT: f32 = 1e-6;

pub struct KMeansInput<'a> {
    pub data: &'a [f32],
    pub dim: usize,
    pub k: usize,
    /// When set, centroids are rescaled to this norm after every update.
    pub avg_norm: Option<f32>,
}

pub struct KMeansOutput {
    pub centroids: Vec<f32>,
    pub assignments: Vec<u32>,
}

/// Assigns every row to its nearest centroid, writing the centroid index
/// and the squared distance. Shared with the partition step.
pub(crate) fn elkan_assign(
    data: &[f32],
    dim: usize,
    centroids: &[f32],
    k: usize,
    assignments: &mut [u32],
    dists: &mut [f32],
) {
    debug_assert_eq!(centroids.len(), k * dim);
    // quarter_cc[b * k + c] = 0.25 * ||centroid_b - centroid_c||^2. If the
    // current best is below it, candidate c cannot win.
    let mut quarter_cc = vec![0.0f32; k * k];
    for b in 0..k {
        for c in (b + 1)..k {
            let d = 0.25 * l2_sqr_f32(&centroids[b * dim..(b + 1) * dim], &centroids[c * dim..(c + 1) * dim]);
            quarter_cc[b * k + c] = d;
            quarter_cc[c * k + b] = d;
        }
    }

    data.par_chunks(dim)
        .zip(assignments.par_iter_mut().zip(dists.par_iter_mut()))
        .for_each(|(row, (assign, dist))| {
            let mut best = 0usize;
            let mut best_d = l2_sqr_f32(row, &centroids[..dim]);
            for c in 1..k {
                if best_d <= quarter_cc[best * k + c] {
                    continue;
                }
                let d = l2_sqr_f32(row, &centroids[c * dim..(c + 1) * dim]);
                if d < best_d {
                    best = c;
                    best_d = d;
                }
            }
            *assign = best as u32;
            *dist = best_d;
        });
}

pub fn cluster(input: &KMeansInput) -> KMeansOutput {
    let n = input.data.len() / input.dim;
    let (dim, k) = (input.dim, input.k);
    assert!(k > 0 && n >= k, "{n} rows cannot seed {k} centers");

    let picked = rand::seq::index::sample(&mut rand::thread_rng(), n, k);
    let mut centroids = vec![0.0f32; k * dim];
    for (c, row) in picked.iter().enumerate() {
        centroids[c * dim..(c + 1) * dim].copy_from_slice(&input.data[row * dim..(row + 1) * dim]);
    }

    let mut assignments = vec![0u32; n];
    let mut dists = vec![0.0f32; n];
    let mut sums = vec![0.0f32; k * dim];
    let mut counts = vec![0u32; k];

    for iteration in 0..MAX_ITERATIONS {
        elkan_assign(input.data, dim, &centroids, k, &mut assignments, &mut dists);

        sums.fill(0.0);
        counts.fill(0);
        for (row, &assign) in input.data.chunks(dim).zip(assignments.iter()) {
            let sum = &mut sums[assign as usize * dim..(assign as usize + 1) * dim];
            for (s, v) in sum.iter_mut().zip(row) {
                *s += v;
            }
            counts[assign as usize] += 1;
        }

        // Reseed empty centers from the rows currently worst-served.
        for c in 0..k {
            if counts[c] > 0 {
                continue;
            }
            let (far_row, _) = dists
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |acc, (i, &d)| if d > acc.1 { (i, d) } else { acc });
            let row = &input.data[far_row * dim..(far_row + 1) * dim];
            sums[c * dim..(c + 1) * dim].copy_from_slice(row);
            counts[c] = 1;
            dists[far_row] = 0.0;
        }

        let mut shift = 0.0f32;
        let mut scale = 0.0f32;
        for c in 0..k {
            let inv = 1.0 / counts[c] as f32;
            let mut next: Vec<f32> = sums[c * dim..(c + 1) * dim].iter().map(|s| s * inv).collect();
            if let Some(avg_norm) = input.avg_norm {
                let norm = norm_f32(&next);
                if norm > 0.0 {
                    let factor = avg_norm / norm;
                    for v in next.iter_mut() {
                        *v *= factor;
                    }
                }
            }
            let old = &mut centroids[c * dim..(c + 1) * dim];
            shift += l2_sqr_f32(old, &next);
            scale += norm_f32(&next);
            old.copy_from_slice(&next);
        }

        if shift <= RELATIVE_SHIFT_EXIT * scale.max(f32::MIN_POSITIVE) {
            tracing::debug!(iteration, shift, "k-means converged early");
            break;
        }
    }

    elkan_assign(input.data, dim, &centroids, k, &mut assignments, &mut dists);
    KMeansOutput {
        centroids,
        assignments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corner_data() -> Vec<f32> {
        vec![
            0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, // corner at origin
            10.0, 10.0, 10.0, 11.0, 11.0, 10.0, 11.0, 11.0, // far corner
        ]
    }

    #[test]
    fn separates_two_corners() {
        let data = corner_data();
        let out = cluster(&KMeansInput {
            data: &data,
            dim: 2,
            k: 2,
            avg_norm: None,
        });
        // The two corners must land in different clusters, each intact.
        let first = out.assignments[0];
        assert!(out.assignments[..4].iter().all(|&a| a == first));
        assert!(out.assignments[4..].iter().all(|&a| a != first));
        let c = out.assignments[4] as usize;
        let far = &out.centroids[c * 2..c * 2 + 2];
        assert!((far[0] - 10.5).abs() < 1e-3 && (far[1] - 10.5).abs() < 1e-3);
    }

    #[test]
    fn elkan_matches_exhaustive_assignment() {
        let data: Vec<f32> = (0..64).map(|v| ((v * 37) % 29) as f32).collect();
        let centroids: Vec<f32> = (0..16).map(|v| ((v * 13) % 17) as f32).collect();
        let (n, dim, k) = (16, 4, 4);
        let mut assignments = vec![0u32; n];
        let mut dists = vec![0.0f32; n];
        elkan_assign(&data, dim, &centroids, k, &mut assignments, &mut dists);
        for i in 0..n {
            let row = &data[i * dim..(i + 1) * dim];
            let (best, best_d) = (0..k)
                .map(|c| (c, l2_sqr_f32(row, &centroids[c * dim..(c + 1) * dim])))
                .fold((0usize, f32::MAX), |acc, (c, d)| if d < acc.1 { (c, d) } else { acc });
            assert_eq!(assignments[i], best as u32);
            assert_eq!(dists[i], best_d);
        }
    }

    #[test]
    fn norm_adjusted_update_scales_centroids() {
        let data = corner_data();
        let out = cluster(&KMeansInput {
            data: &data[8..], // far corner only, no zero vectors
            dim: 2,
            k: 2,
            avg_norm: Some(1.0),
        });
        for c in out.centroids.chunks(2) {
            assert!((norm_f32(c) - 1.0).abs() < 1e-5);
        }
    }
}
