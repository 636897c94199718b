//! Binary tensor container I/O
//!
//! Reads and writes single tensors in the flat binary layout consumed by
//! the downstream inference engine:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ int64   rank              (little-endian)    │
//! │ int64   shape[rank]       (little-endian)    │
//! │ float32 data[prod(shape)] (row-major)        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! There is no magic number, version tag, or checksum; structural
//! validation is entirely the caller's responsibility. The format is
//! little-endian only.
//!
//! Writes go to a temporary sibling path and are renamed into place only
//! on success, so a failed export never leaves a file indistinguishable
//! from a complete one.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{EmpacarError, Result};
use crate::tensor::Tensor;

/// Read a little-endian i64 from `bytes` at `*offset`, advancing it.
fn read_i64(bytes: &[u8], offset: &mut usize, what: &str) -> Result<i64> {
    let end = *offset + 8;
    let slice = bytes
        .get(*offset..end)
        .ok_or_else(|| EmpacarError::FormatError {
            reason: format!("short read: {what} needs 8 bytes at offset {offset}"),
        })?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    *offset = end;
    Ok(i64::from_le_bytes(buf))
}

/// Serialize a tensor into the container byte layout
#[must_use]
pub fn tensor_to_bytes(tensor: &Tensor<f32>) -> Vec<u8> {
    let shape = tensor.shape();
    let data = tensor.data();

    let mut bytes = Vec::with_capacity(8 + shape.len() * 8 + data.len() * 4);
    bytes.extend_from_slice(&(shape.len() as i64).to_le_bytes());
    for &dim in shape {
        bytes.extend_from_slice(&(dim as i64).to_le_bytes());
    }
    for &value in data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Parse a tensor from the container byte layout
///
/// Reads the rank, then exactly `rank` dimensions, then exactly
/// `prod(shape)` elements. Trailing bytes after the declared payload are
/// ignored, matching the downstream loader.
///
/// # Errors
///
/// Returns [`EmpacarError::FormatError`] if:
/// - The rank is negative
/// - Any dimension is zero or negative
/// - The element-count product overflows the 64-bit signed range
/// - The buffer ends before the declared shape or element data
pub fn tensor_from_bytes(bytes: &[u8]) -> Result<Tensor<f32>> {
    let mut offset = 0usize;

    let rank = read_i64(bytes, &mut offset, "rank")?;
    let rank = usize::try_from(rank).map_err(|_| EmpacarError::FormatError {
        reason: format!("negative rank: {rank}"),
    })?;

    // Reject a shape block the buffer cannot possibly hold before
    // allocating for it.
    if rank.checked_mul(8).map_or(true, |n| bytes.len() - offset < n) {
        return Err(EmpacarError::FormatError {
            reason: format!(
                "short read: {rank} shape dims declared, buffer has {} bytes",
                bytes.len()
            ),
        });
    }

    let mut shape = Vec::with_capacity(rank);
    let mut count: i64 = 1;
    for i in 0..rank {
        let dim = read_i64(bytes, &mut offset, "shape dim")?;
        if dim <= 0 {
            return Err(EmpacarError::FormatError {
                reason: format!("dimension {i} is {dim}, must be positive"),
            });
        }
        count = count
            .checked_mul(dim)
            .ok_or_else(|| EmpacarError::FormatError {
                reason: format!("element count overflows i64 at dimension {i}"),
            })?;
        shape.push(dim as usize);
    }

    let count = count as usize;
    let data_end =
        count
            .checked_mul(4)
            .and_then(|n| offset.checked_add(n))
            .ok_or_else(|| EmpacarError::FormatError {
                reason: format!("element payload of {count} floats overflows addressing"),
            })?;
    if data_end > bytes.len() {
        return Err(EmpacarError::FormatError {
            reason: format!(
                "short read: {count} elements declared, {} bytes available",
                bytes.len() - offset
            ),
        });
    }

    let mut data = Vec::with_capacity(count);
    for chunk in bytes[offset..data_end].chunks_exact(4) {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(chunk);
        data.push(f32::from_le_bytes(buf));
    }

    Tensor::from_vec(shape, data)
}

/// Write a tensor to `path` in the container format
///
/// The bytes are first written to `<path>.tmp` and renamed into place, so
/// an interrupted write cannot be mistaken for a complete file.
///
/// # Errors
///
/// Returns [`EmpacarError::IoError`] if the path cannot be created,
/// written, or renamed.
pub fn write_tensor(path: &Path, tensor: &Tensor<f32>) -> Result<()> {
    let tmp_path = tmp_sibling(path);

    let file = File::create(&tmp_path).map_err(|e| EmpacarError::IoError {
        message: format!("Failed to create {}: {e}", tmp_path.display()),
    })?;
    let mut writer = BufWriter::new(file);

    let shape = tensor.shape();
    let io_err = |e: std::io::Error| EmpacarError::IoError {
        message: format!("Failed to write {}: {e}", tmp_path.display()),
    };

    writer
        .write_all(&(shape.len() as i64).to_le_bytes())
        .map_err(io_err)?;
    for &dim in shape {
        writer.write_all(&(dim as i64).to_le_bytes()).map_err(io_err)?;
    }
    for &value in tensor.data() {
        writer.write_all(&value.to_le_bytes()).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    drop(writer);

    fs::rename(&tmp_path, path).map_err(|e| EmpacarError::IoError {
        message: format!(
            "Failed to rename {} to {}: {e}",
            tmp_path.display(),
            path.display()
        ),
    })
}

/// Read a tensor from `path`
///
/// The file is memory-mapped and parsed with [`tensor_from_bytes`]; weight
/// files run to hundreds of megabytes and never need a full buffered copy.
///
/// # Errors
///
/// Returns [`EmpacarError::IoError`] if the file cannot be opened or
/// mapped, and [`EmpacarError::FormatError`] for any structural violation.
pub fn read_tensor(path: &Path) -> Result<Tensor<f32>> {
    let file = File::open(path).map_err(|e| EmpacarError::IoError {
        message: format!("Failed to open {}: {e}", path.display()),
    })?;

    // SAFETY: the export contract is single-writer then immutable; mapped
    // files are never mutated while a reader holds the map.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| EmpacarError::IoError {
        message: format!("Failed to map {}: {e}", path.display()),
    })?;

    tensor_from_bytes(&mmap)
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
