//! Byte-level format primitives shared by the value codec and the
//! metadata store.
//!
//! All multi-byte integers are little-endian. Length-prefixed fields are
//! bounded so a corrupt prefix cannot trigger a multi-gigabyte
//! allocation.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use thiserror::Error;

/// Errors that can occur while reading serialised records.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unknown value type byte: {0:#04x}")]
    UnknownType(u8),

    #[error("unknown encoding byte: {0:#04x}")]
    UnknownEncoding(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Computes a CRC32 checksum over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Verifies that `data` matches the expected CRC32 checksum.
pub fn verify_crc32(data: &[u8], expected: u32) -> Result<(), FormatError> {
    let actual = crc32(data);
    if actual != expected {
        return Err(FormatError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// write helpers
// ---------------------------------------------------------------------------

/// Writes a `u8` to the writer.
pub fn write_u8(w: &mut impl Write, val: u8) -> io::Result<()> {
    w.write_all(&[val])
}

/// Writes a `u32` in little-endian.
pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a `u64` in little-endian.
pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes an `i64` in little-endian.
pub fn write_i64(w: &mut impl Write, val: i64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes an `f64` in little-endian.
pub fn write_f64(w: &mut impl Write, val: f64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a length-prefixed byte slice: `[len: u32][data]`.
///
/// Returns an error if the data length exceeds `u32::MAX`.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("data length {} exceeds u32::MAX", data.len()),
        )
    })?;
    write_u32(w, len)?;
    w.write_all(data)
}

/// Writes a collection length as u32, erroring past `u32::MAX`.
pub fn write_len(w: &mut impl Write, len: usize) -> io::Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("collection length {len} exceeds u32::MAX"),
        )
    })?;
    write_u32(w, len)
}

// ---------------------------------------------------------------------------
// read helpers
// ---------------------------------------------------------------------------

/// Reads a `u8` from the reader.
pub fn read_u8(r: &mut impl Read) -> Result<u8, FormatError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

/// Reads a `u32` in little-endian.
pub fn read_u32(r: &mut impl Read) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads a `u64` in little-endian.
pub fn read_u64(r: &mut impl Read) -> Result<u64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads an `i64` in little-endian.
pub fn read_i64(r: &mut impl Read) -> Result<i64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Reads an `f64` in little-endian.
pub fn read_f64(r: &mut impl Read) -> Result<f64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Maximum length we'll allocate when reading a length-prefixed field.
/// 512 MB is generous for any realistic key or value — a corrupt length
/// prefix won't cause a multi-gigabyte allocation.
pub const MAX_FIELD_LEN: usize = 512 * 1024 * 1024;

/// Reads a length-prefixed byte vector: `[len: u32][data]`.
///
/// Returns an error if the declared length exceeds [`MAX_FIELD_LEN`].
pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, FormatError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(FormatError::InvalidData(format!(
            "field length {len} exceeds maximum of {MAX_FIELD_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

/// Caps pre-allocation to avoid huge up-front reservations from corrupt
/// count fields. The loop still iterates `count` times.
pub fn capped_capacity(count: u32) -> usize {
    (count as usize).min(65_536)
}

/// Maximum element count for serialised collections. Catches obviously
/// corrupt u32 values before they drive unbounded loops.
pub const MAX_COLLECTION_COUNT: u32 = 100_000_000;

/// Validates that a deserialised collection count is within bounds.
pub fn validate_collection_count(count: u32, label: &str) -> Result<(), FormatError> {
    if count > MAX_COLLECTION_COUNT {
        return Err(FormatError::InvalidData(format!(
            "{label} count {count} exceeds max {MAX_COLLECTION_COUNT}"
        )));
    }
    Ok(())
}

/// Reads exactly `buf.len()` bytes, mapping short reads to `UnexpectedEof`.
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn u8_round_trip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 42).unwrap();
        assert_eq!(read_u8(&mut Cursor::new(&buf)).unwrap(), 42);
    }

    #[test]
    fn u64_round_trip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, u64::MAX - 7).unwrap();
        assert_eq!(read_u64(&mut Cursor::new(&buf)).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn i64_round_trip() {
        let mut buf = Vec::new();
        write_i64(&mut buf, -1).unwrap();
        assert_eq!(read_i64(&mut Cursor::new(&buf)).unwrap(), -1);

        let mut buf2 = Vec::new();
        write_i64(&mut buf2, i64::MAX).unwrap();
        assert_eq!(read_i64(&mut Cursor::new(&buf2)).unwrap(), i64::MAX);
    }

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello world").unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(&buf)).unwrap(), b"hello world");
    }

    #[test]
    fn empty_bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"").unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(&buf)).unwrap(), b"");
    }

    #[test]
    fn truncated_input_returns_eof() {
        let buf = [0u8; 2];
        let err = read_u32(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::UnexpectedEof));
    }

    #[test]
    fn read_bytes_rejects_oversized_length() {
        let bogus_len = (MAX_FIELD_LEN as u32) + 1;
        let mut buf = Vec::new();
        write_u32(&mut buf, bogus_len).unwrap();
        let err = read_bytes(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::InvalidData(_)));
    }

    #[test]
    fn crc32_deterministic() {
        assert_eq!(crc32(b"test data"), crc32(b"test data"));
        assert_ne!(crc32(b"test data"), crc32(b"other data"));
    }

    #[test]
    fn verify_crc32_fail() {
        let err = verify_crc32(b"data", 0xBAD).unwrap_err();
        assert!(matches!(err, FormatError::ChecksumMismatch { .. }));
    }
}
