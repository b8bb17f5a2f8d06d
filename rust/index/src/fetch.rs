//! Async bucket-fetch engine.
//!
//! One search batch turns into a deduplicated list of block reads shared by
//! every query that subscribed to the block. Reads are issued in waves of at
//! most the kernel queue depth: a fixed pool of submit workers performs the
//! aligned direct reads for its share of the wave, handing each filled
//! buffer through a bounded channel to the wait workers, which scan the
//! block against its subscribers inline and merge results under that
//! query's lock. Buffer ownership rides the completion itself; everything
//! else built here is read-only once the workers start.

use std::collections::HashMap;

use crossbeam::channel;
use parking_lot::Mutex;
use silo_distance::{Accum, Computer, Element};

use crate::heap::FlatHeap;
use crate::ids::parse_block_id;
use crate::store::{AlignedBuf, BucketStore};

const QUEUE_DEPTH_CAP: usize = 1024;
const SUBMIT_WORKERS: usize = 8;
const WAIT_WORKERS: usize = 8;

/// Kernel async-I/O completion budget; the wave size never exceeds it.
fn max_kernel_events() -> usize {
    std::fs::read_to_string("/proc/sys/fs/aio-max-nr")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(QUEUE_DEPTH_CAP)
}

pub(crate) fn queue_depth() -> usize {
    QUEUE_DEPTH_CAP.min(max_kernel_events()).max(1)
}

/// Unique blocks of one search batch and the queries subscribed to each.
pub(crate) struct CoalescedBatch {
    /// Unique block labels in first-seen order; one read each.
    pub locs: Vec<u32>,
    /// label -> indices of the queries that probe it.
    pub subscribers: HashMap<u32, Vec<u32>>,
}

pub(crate) fn coalesce(labels_per_query: &[Vec<u32>]) -> CoalescedBatch {
    let mut locs = Vec::new();
    let mut subscribers: HashMap<u32, Vec<u32>> = HashMap::new();
    for (qidx, labels) in labels_per_query.iter().enumerate() {
        for &label in labels {
            match subscribers.entry(label) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(vec![qidx as u32]);
                    locs.push(label);
                }
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    // Queries arrive in order, so a duplicate subscription
                    // can only be the most recent push.
                    if *entry.get().last().unwrap() != qidx as u32 {
                        entry.get_mut().push(qidx as u32);
                    }
                }
            }
        }
    }
    CoalescedBatch { locs, subscribers }
}

/// Where per-block scan results land. Implementations own the per-query
/// locking; distance computation stays outside it.
pub(crate) trait ScanSink<A: Accum>: Sync {
    fn merge(&self, qidx: usize, pairs: &[(A, u32)]);
}

/// Top-k merge target: one sentinel-seeded heap per query.
pub(crate) struct TopkSink<A> {
    pub heaps: Vec<Mutex<FlatHeap<A>>>,
}

impl<A: Accum> ScanSink<A> for TopkSink<A> {
    fn merge(&self, qidx: usize, pairs: &[(A, u32)]) {
        let mut heap = self.heaps[qidx].lock();
        for &(dist, id) in pairs {
            heap.push(dist, id);
        }
    }
}

/// Range-search target: keeps everything within the widened radius.
pub(crate) struct RangeSink<A> {
    pub rows: Vec<Mutex<Vec<(A, u32)>>>,
    pub threshold: f32,
}

impl<A: Accum> ScanSink<A> for RangeSink<A> {
    fn merge(&self, qidx: usize, pairs: &[(A, u32)]) {
        let matched: Vec<(A, u32)> = pairs
            .iter()
            .filter(|(dist, _)| dist.to_f32() <= self.threshold)
            .copied()
            .collect();
        if !matched.is_empty() {
            self.rows[qidx].lock().extend(matched);
        }
    }
}

/// Runs the whole batch: opens descriptors, then drains `locs` in waves.
pub(crate) fn fetch_and_scan<E: Element, S: ScanSink<E::Acc>>(
    store: &mut BucketStore,
    queries: &[E],
    dim: usize,
    batch: &CoalescedBatch,
    computer: Computer<E>,
    sink: &S,
) {
    // Descriptor cache fills single-threaded; read-only below.
    for &label in &batch.locs {
        let (cid, _) = parse_block_id(label);
        store.ensure_open(cid);
    }
    let store = &*store;

    let depth = queue_depth();
    let waves = batch.locs.len().div_ceil(depth.max(1)).max(1);
    tracing::debug!(
        blocks = batch.locs.len(),
        queue_depth = depth,
        waves,
        "fetch batch"
    );

    for wave in batch.locs.chunks(depth) {
        let (tx, rx) = channel::bounded::<(u32, AlignedBuf)>(wave.len());
        std::thread::scope(|scope| {
            let share = wave.len().div_ceil(SUBMIT_WORKERS).max(1);
            for chunk in wave.chunks(share) {
                let tx = tx.clone();
                scope.spawn(move || {
                    for &label in chunk {
                        let (cid, bid) = parse_block_id(label);
                        let block = store.read_block(cid, bid);
                        tx.send((label, block))
                            .expect("completion channel closed before wave drained");
                    }
                });
            }
            drop(tx);
            for _ in 0..WAIT_WORKERS {
                let rx = rx.clone();
                scope.spawn(move || {
                    for (label, block) in rx.iter() {
                        scan_block::<E, S>(&block, label, queries, dim, batch, computer, sink);
                    }
                });
            }
        });
    }
}

/// Scans one completed block against every subscribed query. Runs on the
/// wait worker that reaped the completion.
fn scan_block<E: Element, S: ScanSink<E::Acc>>(
    block: &[u8],
    label: u32,
    queries: &[E],
    dim: usize,
    batch: &CoalescedBatch,
    computer: Computer<E>,
    sink: &S,
) {
    let vec_size = dim * std::mem::size_of::<E>();
    let entry_size = vec_size + 4;
    let claimed = u32::from_le_bytes(block[..4].try_into().unwrap()) as usize;
    let entry_num = claimed.min((block.len() - 4) / entry_size);
    debug_assert_eq!(claimed, entry_num);
    let entries = &block[4..];

    let mut pairs = Vec::with_capacity(entry_num);
    for &qidx in &batch.subscribers[&label] {
        let query = &queries[qidx as usize * dim..(qidx as usize + 1) * dim];
        pairs.clear();
        for k in 0..entry_num {
            let entry = &entries[k * entry_size..(k + 1) * entry_size];
            let vector: &[E] = bytemuck::cast_slice(&entry[..vec_size]);
            let gid = u32::from_le_bytes(entry[vec_size..].try_into().unwrap());
            pairs.push((computer(vector, query), gid));
        }
        sink.merge(qidx as usize, &pairs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::compose_block_id;
    use crate::store::cluster_data_path;
    use std::io::Write;

    #[test]
    fn coalesce_dedupes_across_and_within_queries() {
        let shared = compose_block_id(0, 0);
        let other = compose_block_id(1, 5);
        // Both queries probe the shared bucket; query 1 probes it twice.
        let labels = vec![vec![shared, other], vec![shared, shared]];
        let batch = coalesce(&labels);
        assert_eq!(batch.locs, vec![shared, other]);
        assert_eq!(batch.subscribers[&shared], vec![0, 1]);
        assert_eq!(batch.subscribers[&other], vec![0]);
    }

    #[test]
    fn shared_bucket_is_read_once_and_feeds_both_heaps() {
        let dir = tempfile::tempdir().unwrap();
        let block_size = 4096usize;
        // One block, two f32 entries of dim 2: (0,0) id 7 and (3,4) id 9.
        let mut block = Vec::new();
        block.extend_from_slice(&2u32.to_le_bytes());
        for (v, id) in [([0.0f32, 0.0], 7u32), ([3.0, 4.0], 9)] {
            block.extend_from_slice(bytemuck::cast_slice(&v));
            block.extend_from_slice(&id.to_le_bytes());
        }
        block.resize(block_size, 0);
        std::fs::File::create(cluster_data_path(dir.path(), 0))
            .unwrap()
            .write_all(&block)
            .unwrap();

        let label = compose_block_id(0, 0);
        let batch = coalesce(&[vec![label], vec![label]]);
        assert_eq!(batch.locs.len(), 1);

        let queries = vec![0.0f32, 0.0, 3.0, 4.0];
        let sink = TopkSink {
            heaps: (0..2).map(|_| Mutex::new(FlatHeap::<f32>::new(1))).collect(),
        };
        let mut store = BucketStore::open(dir.path(), block_size);
        let computer = silo_distance::select_computer::<f32>(silo_distance::Metric::L2).unwrap();
        fetch_and_scan::<f32, _>(&mut store, &queries, 2, &batch, computer, &sink);

        let heaps: Vec<_> = sink
            .heaps
            .into_iter()
            .map(|h| h.into_inner().into_sorted())
            .collect();
        assert_eq!(heaps[0], (vec![0.0], vec![7]));
        assert_eq!(heaps[1], (vec![0.0], vec![9]));
    }

    #[test]
    fn range_sink_applies_threshold_before_collecting() {
        let sink = RangeSink::<f32> {
            rows: vec![Mutex::new(Vec::new())],
            threshold: 1.5,
        };
        sink.merge(0, &[(0.5, 1), (1.5, 2), (2.0, 3)]);
        let row = sink.rows[0].lock();
        assert_eq!(*row, vec![(0.5, 1), (1.5, 2)]);
    }

    #[test]
    fn queue_depth_is_clamped() {
        let depth = queue_depth();
        assert!(depth >= 1 && depth <= QUEUE_DEPTH_CAP);
    }
}
