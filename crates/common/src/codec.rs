//! Bounded readers and writers for the binary record formats.
//!
//! Every record the engine persists is a flat little-endian sequence.
//! Readers check the remaining length before each field so a short or
//! corrupted record is rejected with a [`CodecError`] instead of panicking.

use bytes::{Buf, BufMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("record truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Write `value` as a length byte followed by its significant little-endian bytes.
pub fn put_compact_i64(buf: &mut impl BufMut, value: i64) {
    let bytes = (value as u64).to_le_bytes();
    let len = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

/// Encode a compact integer into a standalone byte vector.
pub fn compact_i64_bytes(value: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    put_compact_i64(&mut out, value);
    out
}

/// Write a `u16` length-prefixed byte string.
pub fn put_str16(buf: &mut impl BufMut, value: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(value.len())
        .map_err(|_| CodecError::Invalid(format!("string of {} bytes too long", value.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(value);
    Ok(())
}

/// Sequential reader over a borrowed record.
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn i16(&mut self) -> Result<i16, CodecError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn str16(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    pub fn compact_i64(&mut self) -> Result<i64, CodecError> {
        let len = self.u8()? as usize;
        if len > 8 {
            return Err(CodecError::Invalid(format!(
                "compact integer of {} bytes",
                len
            )));
        }
        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(self.bytes(len)?);
        Ok(u64::from_le_bytes(bytes) as i64)
    }

    /// Require the record to be fully consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Decode a standalone compact integer.
pub fn compact_i64_from(bytes: &[u8]) -> Result<i64, CodecError> {
    let mut reader = RecordReader::new(bytes);
    let value = reader.compact_i64()?;
    reader.finish()?;
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compact_encoding_drops_high_zero_bytes() {
        assert_eq!(compact_i64_bytes(0), vec![0]);
        assert_eq!(compact_i64_bytes(0x1234), vec![2, 0x34, 0x12]);
        assert_eq!(compact_i64_bytes(-1).len(), 9);
        assert_eq!(compact_i64_from(&compact_i64_bytes(1_700_000_000)), Ok(1_700_000_000));
        assert_eq!(compact_i64_from(&compact_i64_bytes(-5)), Ok(-5));
    }

    #[test]
    fn test_reader_rejects_short_input() {
        let mut reader = RecordReader::new(&[1, 2, 3]);
        assert_eq!(
            reader.u32(),
            Err(CodecError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_reader_rejects_oversized_compact() {
        let mut reader = RecordReader::new(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(reader.compact_i64(), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn test_finish_reports_trailing_bytes() {
        let mut buf = Vec::new();
        put_str16(&mut buf, b"abc").unwrap();
        buf.push(7);
        let mut reader = RecordReader::new(&buf);
        assert_eq!(reader.str16().unwrap(), b"abc");
        assert_eq!(reader.finish(), Err(CodecError::TrailingBytes(1)));
    }
}
