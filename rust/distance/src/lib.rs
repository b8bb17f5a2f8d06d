pub mod kernels;
pub mod types;

pub use kernels::*;
pub use types::*;

pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    vector.iter().map(|x| x / (norm + 1e-32)).collect()
}

/// Widens a stored row to `f32` for the clustering and graph paths.
pub fn widen<E: Element>(row: &[E]) -> Vec<f32> {
    row.iter().map(|x| x.to_f32()).collect()
}
