//! Binary snapshot of one embedding column.
//!
//! # Format
//!
//! - Header (16 bytes): magic `EVEC`, version, dimension, row count
//! - Rows: record id (u64), sequence (u64), presence flag (u8), then
//!   `dimension` little-endian `f32` values. Absent embeddings are written as
//!   zeros so every row has the same stride.
//!
//! Segments are written to a temporary file and renamed into place, and read
//! back through a memory map.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;

use crate::error::{EmbedError, EmbedResult, IoContext};
use crate::vector::{Embedding, EntityTable, RecordId, VectorContract, VectorDimension};

const SEGMENT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 16;

const MAGIC_BYTES: &[u8; 4] = b"EVEC";

const BYTES_PER_F32: usize = 4;

/// id + seq + presence flag
const ROW_PREFIX: usize = 8 + 8 + 1;

/// One row as stored in a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub id: RecordId,
    pub seq: u64,
    pub embedding: Option<Embedding>,
}

pub fn segment_path(dir: &Path, table: EntityTable) -> PathBuf {
    dir.join(format!("{}.vec", table.name()))
}

fn row_stride(dimension: usize) -> usize {
    ROW_PREFIX + dimension * BYTES_PER_F32
}

/// Writes all rows of one table, replacing any previous segment.
pub fn write_segment<'a>(
    path: &Path,
    dimension: VectorDimension,
    rows: impl ExactSizeIterator<Item = (RecordId, u64, Option<&'a [f32]>)>,
) -> EmbedResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    let count = u32::try_from(rows.len()).map_err(|_| EmbedError::InvalidFormat {
        path: path.to_path_buf(),
        reason: "too many rows for one segment".to_string(),
    })?;

    let tmp = path.with_extension("vec.tmp");
    let file = File::create(&tmp).with_path(&tmp)?;
    let mut out = BufWriter::new(file);

    let dim = dimension.get();
    let zeros = vec![0.0f32; dim];

    let write = || -> std::io::Result<()> {
        out.write_all(MAGIC_BYTES)?;
        out.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        out.write_all(&(dim as u32).to_le_bytes())?;
        out.write_all(&count.to_le_bytes())?;

        for (id, seq, vector) in rows {
            out.write_all(&id.to_bytes())?;
            out.write_all(&seq.to_le_bytes())?;
            out.write_all(&[u8::from(vector.is_some())])?;
            let values = match vector {
                Some(v) => v,
                None => &zeros[..],
            };
            for &value in values {
                out.write_all(&value.to_le_bytes())?;
            }
        }
        out.flush()?;
        out.get_ref().sync_all()
    };
    write().with_path(&tmp)?;

    std::fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}

/// Reads a segment written by [`write_segment`]. Stored vectors are checked
/// against `contract` so a segment from a different configuration is
/// rejected instead of silently loaded.
pub fn read_segment(path: &Path, contract: &VectorContract) -> EmbedResult<Vec<SegmentRow>> {
    let invalid = |reason: String| EmbedError::InvalidFormat {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).with_path(path)?;
    if file.metadata().with_path(path)?.len() == 0 {
        return Err(invalid("empty segment file".to_string()));
    }
    let mmap = unsafe { MmapOptions::new().map(&file).with_path(path)? };

    if mmap.len() < HEADER_SIZE {
        return Err(invalid("file too small to contain header".to_string()));
    }
    if &mmap[0..4] != MAGIC_BYTES {
        return Err(invalid("invalid magic bytes".to_string()));
    }
    let version = read_u32(&mmap, 4);
    if version != SEGMENT_VERSION {
        return Err(invalid(format!(
            "unsupported segment version {version}, expected {SEGMENT_VERSION}"
        )));
    }
    let dim = read_u32(&mmap, 8) as usize;
    if dim != contract.dimension().get() {
        return Err(invalid(format!(
            "segment dimension {dim} does not match configured {}",
            contract.dimension().get()
        )));
    }
    let count = read_u32(&mmap, 12) as usize;

    let stride = row_stride(dim);
    let expected = HEADER_SIZE + count * stride;
    if mmap.len() != expected {
        return Err(invalid(format!(
            "expected {expected} bytes for {count} rows, found {}",
            mmap.len()
        )));
    }

    let mut rows = Vec::with_capacity(count);
    for offset in (HEADER_SIZE..expected).step_by(stride) {
        let id = RecordId::from_bytes(read_array(&mmap, offset));
        let seq = u64::from_le_bytes(read_array(&mmap, offset + 8));
        let present = mmap[offset + 16] != 0;

        let embedding = if present {
            let data = &mmap[offset + ROW_PREFIX..offset + stride];
            let values: Vec<f32> = data
                .chunks_exact(BYTES_PER_F32)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Some(
                contract
                    .embedding(values)
                    .map_err(|e| invalid(format!("record {id}: {e}")))?,
            )
        } else {
            None
        };

        rows.push(SegmentRow { id, seq, embedding });
    }

    Ok(rows)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_array(bytes, offset))
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn contract(dim: usize) -> VectorContract {
        VectorContract::new(VectorDimension::new(dim).unwrap())
    }

    #[test]
    fn test_segment_preserves_rows_and_nulls() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), EntityTable::Chunks);
        let a = [1.0f32, -2.5, 3.25];

        let rows = vec![
            (RecordId::new(7), 4u64, Some(&a[..])),
            (RecordId::new(9), 5u64, None),
        ];
        write_segment(&path, VectorDimension::new(3).unwrap(), rows.into_iter()).unwrap();

        let loaded = read_segment(&path, &contract(3)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, RecordId::new(7));
        assert_eq!(loaded[0].seq, 4);
        assert_eq!(loaded[0].embedding.as_ref().unwrap().as_slice(), &a);
        assert_eq!(loaded[1].embedding, None);
        assert!(!path.with_extension("vec.tmp").exists());
    }

    #[test]
    fn test_dimension_change_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), EntityTable::Images);
        write_segment(&path, VectorDimension::new(3).unwrap(), std::iter::empty()).unwrap();

        assert!(matches!(
            read_segment(&path, &contract(4)),
            Err(EmbedError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_truncated_segment_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), EntityTable::Documents);
        let v = [0.0f32; 3];
        write_segment(
            &path,
            VectorDimension::new(3).unwrap(),
            vec![(RecordId::new(1), 1u64, Some(&v[..]))].into_iter(),
        )
        .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(matches!(
            read_segment(&path, &contract(3)),
            Err(EmbedError::InvalidFormat { .. })
        ));
    }
}
