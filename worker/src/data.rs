pub mod event_map;
pub mod job_transfer;
pub mod job_tree;
pub mod reduce;

#[cfg(test)]
mod reduce_test;

use thiserror::Error;

pub type JobId = i32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload truncated at byte {0}")]
    Truncated(usize),
    #[error("payload has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// Little-endian wire primitives shared by every payload format.
pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn take_i32(bytes: &[u8], pos: &mut usize) -> Result<i32, CodecError> {
    let end = *pos + 4;
    let slice = bytes.get(*pos..end).ok_or(CodecError::Truncated(*pos))?;
    *pos = end;
    Ok(i32::from_le_bytes(slice.try_into().unwrap()))
}

pub fn take_f32(bytes: &[u8], pos: &mut usize) -> Result<f32, CodecError> {
    let end = *pos + 4;
    let slice = bytes.get(*pos..end).ok_or(CodecError::Truncated(*pos))?;
    *pos = end;
    Ok(f32::from_le_bytes(slice.try_into().unwrap()))
}

pub fn take_f64(bytes: &[u8], pos: &mut usize) -> Result<f64, CodecError> {
    let end = *pos + 8;
    let slice = bytes.get(*pos..end).ok_or(CodecError::Truncated(*pos))?;
    *pos = end;
    Ok(f64::from_le_bytes(slice.try_into().unwrap()))
}

pub fn finish(bytes: &[u8], pos: usize) -> Result<(), CodecError> {
    if pos == bytes.len() {
        Ok(())
    } else {
        Err(CodecError::TrailingBytes(bytes.len() - pos))
    }
}

/// Flat vector of i32s, the `IntVec` payload.
pub fn encode_ints(values: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        put_i32(&mut buf, v);
    }
    buf
}

pub fn decode_ints(bytes: &[u8]) -> Result<Vec<i32>, CodecError> {
    let mut pos = 0;
    let mut out = Vec::with_capacity(bytes.len() / 4);
    while pos < bytes.len() {
        out.push(take_i32(bytes, &mut pos)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_vec_round_trip() {
        let values = vec![0, -1, i32::MAX, i32::MIN, 42];
        assert_eq!(decode_ints(&encode_ints(&values)).unwrap(), values);
    }

    #[test]
    fn truncation_detected() {
        let bytes = encode_ints(&[1, 2]);
        assert_eq!(
            decode_ints(&bytes[..7]).unwrap_err(),
            CodecError::Truncated(4)
        );
    }
}
