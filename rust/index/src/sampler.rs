//! Single-pass reservoir sampling (Algorithm R) over a vector file.
//!
//! After processing `n` rows every row is retained with probability
//! `min(1, s/n)`. Memory never exceeds the reservoir plus one spare row.

use std::path::Path;

use bytemuck::Zeroable;
use rand::Rng;
use silo_distance::Element;

use crate::codec::{CodecError, VectorReader};

pub fn reservoir_sample<E: Element>(
    data_file: &Path,
    sample_rows: usize,
) -> Result<(Vec<E>, usize), CodecError> {
    let mut reader = VectorReader::<E>::open(data_file)?;
    let dim = reader.dim() as usize;
    let total = reader.rows() as usize;
    let s = sample_rows.min(total);

    let mut reservoir = vec![E::zeroed(); s * dim];
    reader.read_rows(&mut reservoir, s)?;

    let mut row = vec![E::zeroed(); dim];
    let mut rng = rand::thread_rng();
    for i in s..total {
        reader.read_rows(&mut row, 1)?;
        let j = rng.gen_range(0..=i);
        if j < s {
            reservoir[j * dim..(j + 1) * dim].copy_from_slice(&row);
        }
    }
    Ok((reservoir, s))
}
