//! Bucket store.
//!
//! Each coarse cluster owns one write-once file of fixed-size blocks. The
//! read path opens those files with `O_DIRECT` and hands out 512-byte
//! aligned buffers; offsets and lengths are always whole blocks. Failures
//! at this layer mean the host is misconfigured, so they are fatal rather
//! than reported.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::codec;

pub const PAGE_SIZE: usize = 4096;
pub const BUFFER_ALIGN: usize = 512;

/// Bytes reserved for the per-block entry count.
pub const BLOCK_COUNT_BYTES: usize = 4;

pub fn cluster_data_path(prefix: &Path, cid: u32) -> PathBuf {
    prefix.join(format!("cluster-{cid}-raw_data.bin"))
}

pub fn cluster_ids_path(prefix: &Path, cid: u32) -> PathBuf {
    prefix.join(format!("cluster-{cid}-global_ids.bin"))
}

pub fn centroids_path(prefix: &Path) -> PathBuf {
    prefix.join("bucket-centroids.bin")
}

pub fn combine_ids_path(prefix: &Path) -> PathBuf {
    prefix.join("cluster-combine_ids.bin")
}

pub fn graph_path(prefix: &Path) -> PathBuf {
    prefix.join("hnsw-index.bin")
}

pub fn meta_path(prefix: &Path) -> PathBuf {
    prefix.join("silo-meta.json")
}

/// Entries that fit in one block alongside the count prefix.
pub fn block_capacity(block_size: usize, dim: usize, elem_size: usize) -> usize {
    (block_size - BLOCK_COUNT_BYTES) / (dim * elem_size + 4)
}

/// Unrecoverable I/O subsystem failure: name the syscall and errno, then
/// abort. These indicate host misconfiguration (ulimits, aio-max-nr) and
/// cannot be recovered within a query batch.
pub(crate) fn fatal(syscall: &str, err: &std::io::Error) -> ! {
    tracing::error!(
        syscall,
        errno = err.raw_os_error().unwrap_or(0),
        error = %err,
        "I/O subsystem failure"
    );
    eprintln!(
        "{syscall}() failed, errno: {}, error: {err}",
        err.raw_os_error().unwrap_or(0)
    );
    std::process::abort();
}

/// Heap buffer aligned for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is uniquely owned; ownership moves with the value.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn alloc(len: usize) -> Self {
        let layout = match Layout::from_size_align(len, BUFFER_ALIGN) {
            Ok(layout) => layout,
            Err(_) => fatal(
                "alloc",
                &std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad layout"),
            ),
        };
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => fatal("alloc", &std::io::Error::from_raw_os_error(libc::ENOMEM)),
        };
        AlignedBuf { ptr, layout }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::ops::Deref for AlignedBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl std::ops::DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

fn open_direct(path: &Path) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).custom_flags(libc::O_DIRECT);
    match opts.open(path) {
        Ok(file) => Ok(file),
        // Filesystems without a backing store (tmpfs) reject O_DIRECT at
        // open time; fall back to page-cache reads there. Every other
        // failure is the caller's to treat as fatal.
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            tracing::debug!(path = %path.display(), "O_DIRECT unsupported, using buffered reads");
            OpenOptions::new().read(true).open(path)
        }
        Err(err) => Err(err),
    }
}

/// Read-only view over the per-cluster block files of one index.
///
/// Descriptors open lazily via `ensure_open` (single-threaded, before any
/// parallel submission) and the cache is read-only afterwards, so `read_block`
/// takes `&self` and is safe to call from the fetch workers.
pub struct BucketStore {
    prefix: PathBuf,
    block_size: usize,
    files: HashMap<u32, File>,
}

impl BucketStore {
    pub fn open(prefix: &Path, block_size: usize) -> Self {
        BucketStore {
            prefix: prefix.to_path_buf(),
            block_size,
            files: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn ensure_open(&mut self, cid: u32) {
        if self.files.contains_key(&cid) {
            return;
        }
        let path = cluster_data_path(&self.prefix, cid);
        // Blocks smaller than a sector cannot satisfy direct-I/O alignment.
        let result = if self.block_size % BUFFER_ALIGN == 0 {
            open_direct(&path)
        } else {
            OpenOptions::new().read(true).open(&path)
        };
        let file = match result {
            Ok(file) => file,
            Err(err) => fatal("open", &err),
        };
        self.files.insert(cid, file);
    }

    /// Reads one whole block into a freshly allocated aligned buffer.
    /// Short reads do not happen for direct I/O against regular files; a
    /// mismatched count is treated as fatal after verification.
    pub fn read_block(&self, cid: u32, bid: u32) -> AlignedBuf {
        let file = self
            .files
            .get(&cid)
            .unwrap_or_else(|| panic!("cluster {cid} descriptor not opened before read"));
        let mut buf = AlignedBuf::alloc(self.block_size);
        let offset = bid as u64 * self.block_size as u64;
        match file.read_at(&mut buf, offset) {
            Ok(n) if n == self.block_size => buf,
            Ok(n) => fatal(
                "pread",
                &std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read: {n} of {} bytes", self.block_size),
                ),
            ),
            Err(err) => fatal("pread", &err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub buckets: u64,
    pub entries: u64,
    pub max_occupancy: u32,
    pub min_occupancy: u32,
}

/// Sequential post-build sweep over every block, for logging and the
/// build-time invariant checks.
pub fn gather_bucket_stats(
    prefix: &Path,
    k1: u32,
    block_size: usize,
) -> Result<BucketStats, codec::CodecError> {
    let mut stats = BucketStats {
        buckets: 0,
        entries: 0,
        max_occupancy: 0,
        min_occupancy: u32::MAX,
    };
    let mut buf = vec![0u8; block_size];
    for cid in 0..k1 {
        let path = cluster_data_path(prefix, cid);
        let mut file = File::open(&path).map_err(|source| codec::CodecError::Io {
            path: path.clone(),
            source,
        })?;
        let file_size = file
            .metadata()
            .map_err(|source| codec::CodecError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        for _ in 0..file_size / block_size as u64 {
            file.read_exact(&mut buf)
                .map_err(|source| codec::CodecError::Io {
                    path: path.clone(),
                    source,
                })?;
            let entry_num = u32::from_le_bytes(buf[..4].try_into().unwrap());
            stats.buckets += 1;
            stats.entries += entry_num as u64;
            stats.max_occupancy = stats.max_occupancy.max(entry_num);
            stats.min_occupancy = stats.min_occupancy.min(entry_num);
        }
    }
    tracing::info!(
        buckets = stats.buckets,
        avg_occupancy = stats.entries as f64 / stats.buckets.max(1) as f64,
        max_occupancy = stats.max_occupancy,
        min_occupancy = stats.min_occupancy,
        "bucket statistics"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn aligned_buf_alignment_and_len() {
        let buf = AlignedBuf::alloc(PAGE_SIZE);
        assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGN, 0);
        assert_eq!(buf.len(), PAGE_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_block_returns_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let block_size = PAGE_SIZE;
        let path = cluster_data_path(dir.path(), 0);
        let mut blocks = vec![0u8; block_size * 2];
        blocks[..4].copy_from_slice(&1u32.to_le_bytes());
        blocks[block_size..block_size + 4].copy_from_slice(&2u32.to_le_bytes());
        File::create(&path).unwrap().write_all(&blocks).unwrap();

        let mut store = BucketStore::open(dir.path(), block_size);
        store.ensure_open(0);
        let block = store.read_block(0, 1);
        assert_eq!(u32::from_le_bytes(block[..4].try_into().unwrap()), 2);
        let block = store.read_block(0, 0);
        assert_eq!(u32::from_le_bytes(block[..4].try_into().unwrap()), 1);
    }

    #[test]
    fn block_capacity_matches_layout() {
        // 128-byte blocks of 2-dim f32 entries: (128 - 4) / (8 + 4) = 10.
        assert_eq!(block_capacity(128, 2, 4), 10);
        // One entry must always fit for a page-sized block at dim 128.
        assert!(block_capacity(PAGE_SIZE, 128, 4) >= 1);
    }
}
