//! Header-prefixed vector files.
//!
//! Every on-disk table in an index directory shares one framing: a little
//! endian `(rows: u32, dim: u32)` header followed by `rows * dim` contiguous
//! elements. Writers that stream an unknown number of rows write a
//! placeholder header first and backpatch it on completion.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytemuck::Zeroable;
use silo_error::{ErrorCodes, SiloError};
use thiserror::Error;

pub const HEADER_BYTES: u64 = 8;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error(
        "{path}: header claims {rows} rows x {dim} cols ({expected} payload bytes) \
         but the file holds {actual}",
        path = .path.display()
    )]
    HeaderMismatch {
        path: PathBuf,
        rows: u32,
        dim: u32,
        expected: u64,
        actual: u64,
    },
    #[error("{path}: {source}", path = .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SiloError for CodecError {
    fn code(&self) -> ErrorCodes {
        match self {
            CodecError::HeaderMismatch { .. } => ErrorCodes::DataLoss,
            CodecError::Io { .. } => ErrorCodes::Internal,
        }
    }
}

fn at(path: &Path) -> impl FnOnce(std::io::Error) -> CodecError + '_ {
    move |source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_header(reader: &mut impl Read, path: &Path) -> Result<(u32, u32), CodecError> {
    let mut header = [0u8; HEADER_BYTES as usize];
    reader.read_exact(&mut header).map_err(at(path))?;
    let rows = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let dim = u32::from_le_bytes(header[4..8].try_into().unwrap());
    Ok((rows, dim))
}

/// Reads `(rows, dim)` without touching the payload.
pub fn read_metadata(path: &Path) -> Result<(u32, u32), CodecError> {
    let mut file = File::open(path).map_err(at(path))?;
    read_header(&mut file, path)
}

/// Reads the header and checks it against the actual file length.
pub fn validate_metadata(path: &Path, elem_size: usize) -> Result<(u32, u32), CodecError> {
    let (rows, dim) = read_metadata(path)?;
    let expected = rows as u64 * dim as u64 * elem_size as u64;
    let actual = std::fs::metadata(path).map_err(at(path))?.len() - HEADER_BYTES;
    if expected != actual {
        return Err(CodecError::HeaderMismatch {
            path: path.to_path_buf(),
            rows,
            dim,
            expected,
            actual,
        });
    }
    Ok((rows, dim))
}

/// Reads a whole vector file into memory.
pub fn read_vectors<T: bytemuck::Pod>(path: &Path) -> Result<(Vec<T>, u32, u32), CodecError> {
    let (rows, dim) = validate_metadata(path, std::mem::size_of::<T>())?;
    let mut reader = BufReader::new(File::open(path).map_err(at(path))?);
    reader
        .seek(SeekFrom::Start(HEADER_BYTES))
        .map_err(at(path))?;
    let mut data = vec![T::zeroed(); rows as usize * dim as usize];
    reader
        .read_exact(bytemuck::cast_slice_mut(&mut data))
        .map_err(at(path))?;
    Ok((data, rows, dim))
}

pub fn write_vectors<T: bytemuck::Pod>(
    path: &Path,
    data: &[T],
    rows: u32,
    dim: u32,
) -> Result<(), CodecError> {
    debug_assert_eq!(data.len(), rows as usize * dim as usize);
    let mut writer = BufWriter::new(File::create(path).map_err(at(path))?);
    writer.write_all(&rows.to_le_bytes()).map_err(at(path))?;
    writer.write_all(&dim.to_le_bytes()).map_err(at(path))?;
    writer
        .write_all(bytemuck::cast_slice(data))
        .map_err(at(path))?;
    writer.flush().map_err(at(path))
}

/// Rewrites the `(rows, dim)` header of an existing file in place.
pub fn backpatch_header(path: &Path, rows: u32, dim: u32) -> Result<(), CodecError> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(at(path))?;
    file.seek(SeekFrom::Start(0)).map_err(at(path))?;
    file.write_all(&rows.to_le_bytes()).map_err(at(path))?;
    file.write_all(&dim.to_le_bytes()).map_err(at(path))?;
    Ok(())
}

/// Streaming row reader; holds at most one caller-sized batch in memory.
pub struct VectorReader<T> {
    reader: BufReader<File>,
    path: PathBuf,
    rows: u32,
    dim: u32,
    cursor: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: bytemuck::Pod> VectorReader<T> {
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        let (rows, dim) = validate_metadata(path, std::mem::size_of::<T>())?;
        let mut reader = BufReader::new(File::open(path).map_err(at(path))?);
        reader
            .seek(SeekFrom::Start(HEADER_BYTES))
            .map_err(at(path))?;
        Ok(VectorReader {
            reader,
            path: path.to_path_buf(),
            rows,
            dim,
            cursor: 0,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    /// Reads up to `max_rows` rows into `out`, returning how many were read.
    pub fn read_rows(&mut self, out: &mut [T], max_rows: usize) -> Result<usize, CodecError> {
        let n = max_rows.min((self.rows - self.cursor) as usize);
        if n == 0 {
            return Ok(0);
        }
        let batch = &mut out[..n * self.dim as usize];
        self.reader
            .read_exact(bytemuck::cast_slice_mut(batch))
            .map_err(at(&self.path))?;
        self.cursor += n as u32;
        Ok(n)
    }
}

/// Append-only writer with a placeholder header, backpatched by `finish`.
pub struct CountingWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    dim: u32,
    rows: u32,
}

impl CountingWriter {
    pub fn create(path: &Path, dim: u32) -> Result<Self, CodecError> {
        let mut writer = BufWriter::new(File::create(path).map_err(at(path))?);
        writer.write_all(&0u32.to_le_bytes()).map_err(at(path))?;
        writer.write_all(&dim.to_le_bytes()).map_err(at(path))?;
        Ok(CountingWriter {
            writer,
            path: path.to_path_buf(),
            dim,
            rows: 0,
        })
    }

    pub fn append_row<T: bytemuck::Pod>(&mut self, row: &[T]) -> Result<(), CodecError> {
        debug_assert_eq!(row.len(), self.dim as usize);
        self.writer
            .write_all(bytemuck::cast_slice(row))
            .map_err(at(&self.path))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn finish(mut self) -> Result<u32, CodecError> {
        self.writer.flush().map_err(at(&self.path))?;
        drop(self.writer);
        backpatch_header(&self.path, self.rows, self.dim)?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_f32() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vecs.bin");
        let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        write_vectors(&path, &data, 3, 2).unwrap();
        let (back, rows, dim) = read_vectors::<f32>(&path).unwrap();
        assert_eq!((rows, dim), (3, 2));
        assert_eq!(back, data);
    }

    #[test]
    fn truncated_payload_is_reported_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        write_vectors(&path, &[7u32, 8, 9], 3, 1).unwrap();
        // Chop the last element off; the header now overstates the payload.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HEADER_BYTES + 8).unwrap();
        let err = read_vectors::<u32>(&path).unwrap_err();
        match err {
            CodecError::HeaderMismatch {
                rows,
                expected,
                actual,
                ..
            } => {
                assert_eq!(rows, 3);
                assert_eq!(expected, 12);
                assert_eq!(actual, 8);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn counting_writer_backpatches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.bin");
        let mut writer = CountingWriter::create(&path, 2).unwrap();
        writer.append_row(&[1i8, 2]).unwrap();
        writer.append_row(&[3i8, 4]).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);
        let (data, rows, dim) = read_vectors::<i8>(&path).unwrap();
        assert_eq!((rows, dim), (2, 2));
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn streaming_reader_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let data: Vec<f32> = (0..10).map(|v| v as f32).collect();
        write_vectors(&path, &data, 5, 2).unwrap();
        let mut reader = VectorReader::<f32>::open(&path).unwrap();
        let mut buf = vec![0.0f32; 4];
        assert_eq!(reader.read_rows(&mut buf, 2).unwrap(), 2);
        assert_eq!(&buf[..4], &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(reader.read_rows(&mut buf, 2).unwrap(), 2);
        assert_eq!(reader.read_rows(&mut buf, 2).unwrap(), 1);
        assert_eq!(&buf[..2], &[8.0, 9.0]);
        assert_eq!(reader.read_rows(&mut buf, 2).unwrap(), 0);
    }
}
