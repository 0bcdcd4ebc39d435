//! Little-endian field access over raw on-disk bytes.
//!
//! All structure parsing in the drivers goes through these helpers: a slice,
//! an offset, and a bounds check that turns out-of-range access into
//! [`FsError::Corrupt`] instead of a panic or a misread.

use crate::error::{FsError, Result};

pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Result<u8> {
    buf.get(offset)
        .copied()
        .ok_or(FsError::Corrupt("field beyond end of record"))
}

pub(crate) fn read_i8(buf: &[u8], offset: usize) -> Result<i8> {
    Ok(read_u8(buf, offset)? as i8)
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(
        read_bytes(buf, offset, 2)?.try_into().unwrap(),
    ))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(
        read_bytes(buf, offset, 4)?.try_into().unwrap(),
    ))
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(
        read_bytes(buf, offset, 8)?.try_into().unwrap(),
    ))
}

/// Bounds-checked subslice.
pub(crate) fn read_bytes(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or(FsError::Corrupt("field beyond end of record"))
}

/// Reads `len` UTF-16LE code units starting at `offset`.
pub(crate) fn read_utf16(buf: &[u8], offset: usize, len: usize) -> Result<Vec<u16>> {
    let raw = read_bytes(buf, offset, len * 2)?;
    Ok(raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

// The put side is only used on buffers the crate sizes itself, so plain
// indexing is fine there.

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Converts UTF-16 code units to ASCII, replacing anything outside the ASCII
/// range with `?`. Name comparisons in this layer fold case in the ASCII
/// range only, so the replacement is lossy but stable.
pub(crate) fn utf16_to_ascii(units: &[u16]) -> String {
    units
        .iter()
        .map(|&u| {
            if u != 0 && u < 0x80 {
                u as u8 as char
            } else {
                '?'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let buf = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(read_u16(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_u32(&buf, 2).unwrap(), 0x12345678);
        assert_eq!(read_u64(&buf, 2).unwrap(), 0xffff_ffff_1234_5678);
    }

    #[test]
    fn out_of_bounds_is_corrupt() {
        let buf = [0u8; 4];
        assert!(matches!(read_u32(&buf, 1), Err(FsError::Corrupt(_))));
        assert!(matches!(read_u64(&buf, 0), Err(FsError::Corrupt(_))));
        assert!(matches!(
            read_bytes(&buf, usize::MAX, 2),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn utf16_conversion_is_ascii_lossy() {
        let units = [b'a' as u16, 0x00e9, b'b' as u16];
        assert_eq!(utf16_to_ascii(&units), "a?b");
    }
}
