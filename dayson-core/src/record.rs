use crate::{CoreError, Result};
use std::io::{Read, Write};

pub const MAX_RANK: usize = 10;

/// Byte length of a record header for the given rank:
/// `rank:i32 | dims:i32 x rank | length:i64`.
pub fn record_header_len(rank: usize) -> u64 {
    4 + 4 * rank as u64 + 8
}

/// Validates a shape and returns its element count.
pub fn element_count(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() || shape.len() > MAX_RANK {
        return Err(CoreError::InvalidArgument(format!(
            "tensor rank {} outside [1, {}]",
            shape.len(),
            MAX_RANK
        )));
    }
    let mut count: u64 = 1;
    for &d in shape {
        count = count
            .checked_mul(d as u64)
            .filter(|&c| c < i64::MAX as u64)
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!("tensor shape {shape:?} overflows"))
            })?;
    }
    Ok(count as usize)
}

/// Serializes a tensor record: header followed by the little-endian f32 data.
pub fn write_record<W: Write>(w: &mut W, shape: &[usize], data: &[f32]) -> Result<()> {
    let count = element_count(shape)?;
    if count != data.len() {
        return Err(CoreError::InvalidArgument(format!(
            "record data length {} does not match shape {:?}",
            data.len(),
            shape
        )));
    }
    w.write_all(&(shape.len() as i32).to_le_bytes())?;
    for &d in shape {
        w.write_all(&(d as i32).to_le_bytes())?;
    }
    w.write_all(&(count as i64).to_le_bytes())?;
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for &v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&bytes)?;
    Ok(())
}

/// Deserializes a tensor record, verifying the header invariants.
///
/// A rank outside [1, 10], a negative dimension, or a stored length that
/// disagrees with the dimension product is corruption, not a recoverable
/// condition.
pub fn read_record<R: Read>(r: &mut R) -> Result<(Vec<usize>, Vec<f32>)> {
    let rank = read_i32(r)?;
    if rank < 1 || rank as usize > MAX_RANK {
        return Err(CoreError::CorruptData(format!(
            "record rank {rank} outside [1, {MAX_RANK}]"
        )));
    }
    let mut shape = Vec::with_capacity(rank as usize);
    for _ in 0..rank {
        let d = read_i32(r)?;
        if d < 0 {
            return Err(CoreError::CorruptData(format!(
                "record dimension {d} is negative"
            )));
        }
        shape.push(d as usize);
    }
    let mut len_bytes = [0u8; 8];
    read_exact(r, &mut len_bytes)?;
    let length = i64::from_le_bytes(len_bytes);
    let mut expected: u64 = 1;
    for &d in &shape {
        expected = expected.saturating_mul(d as u64);
    }
    if length < 0 || length as u64 != expected {
        return Err(CoreError::CorruptData(format!(
            "record length {length} does not match dims {shape:?}"
        )));
    }
    let mut bytes = vec![0u8; length as usize * 4];
    read_exact(r, &mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((shape, data))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CoreError::CorruptData("record truncated".to_string())
        } else {
            CoreError::IoFailure(e)
        }
    })
}
