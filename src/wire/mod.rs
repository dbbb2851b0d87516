/// Framed-stream codec: length-prefixed primitives over any byte stream.
///
/// Every encoder writes a one-byte serializer-version tag at the head of its
/// output; decoders read and keep the tag so nested records know which wire
/// variant they are parsing. Primitives:
/// - fixed-width integers, little-endian
/// - unsigned LEB128 varints for lengths
/// - bounded UTF-8 strings with a null marker distinct from zero-length
/// - single-byte enums validated against the declared set
///
/// Malformed input (unknown enum value, negative or over-limit length,
/// truncation, bad UTF-8) fails `InvalidFormat`; an unknown version tag
/// fails `UnsupportedFormat`.
use std::io::{ErrorKind, Read, Write};
use std::ops::RangeInclusive;

use crate::error::{Result, SetupError};

/// Current serializer version tag.
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on LEB128 length: 10 bytes encode any u64.
const VARINT_MAX_BYTES: u32 = 10;

/// Writer half of the framed codec.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write the serializer-version tag. Must be the first write.
    pub fn write_version(&mut self) -> Result<()> {
        self.write_u8(WIRE_VERSION)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_all(&[value])?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Unsigned LEB128.
    pub fn write_varint(&mut self, mut value: u64) -> Result<()> {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(byte)?;
                return Ok(());
            }
            self.write_u8(byte | 0x80)?;
        }
    }

    /// Varint length prefix followed by the raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_varint(data.len() as u64)?;
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Nullable bounded string: marker byte, then length + UTF-8 bytes.
    pub fn write_string_opt(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            None => self.write_u8(0),
            Some(s) => {
                self.write_u8(1)?;
                self.write_bytes(s.as_bytes())
            }
        }
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_string_opt(Some(value))
    }

    pub fn write_enum(&mut self, value: u8) -> Result<()> {
        self.write_u8(value)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Direct access for bulk payload copies between framed fields.
    pub fn writer(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reader half of the framed codec.
///
/// Holds the version tag consumed by `read_version` so callers can branch
/// on the wire variant when new versions are introduced.
pub struct FrameReader<R: Read> {
    inner: R,
    version: u8,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, version: 0 }
    }

    /// Read and validate the serializer-version tag at the stream head.
    pub fn read_version(&mut self) -> Result<u8> {
        let version = self.read_u8()?;
        if version == 0 || version > WIRE_VERSION {
            return Err(SetupError::UnsupportedFormat(version));
        }
        self.version = version;
        Ok(version)
    }

    /// The version tag consumed by `read_version` (0 if not read yet).
    pub fn version(&self) -> u8 {
        self.version
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                SetupError::InvalidFormat("unexpected end of stream".to_string())
            }
            // Decompressors surface corrupt input as InvalidData.
            ErrorKind::InvalidData => SetupError::InvalidFormat(format!("corrupt stream: {e}")),
            _ => SetupError::Io(e),
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Unsigned LEB128, at most 10 bytes, no bits beyond 64.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 7 * (VARINT_MAX_BYTES - 1) && byte > 1 {
                return Err(SetupError::InvalidFormat("varint overflow".to_string()));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 7 * VARINT_MAX_BYTES {
                return Err(SetupError::InvalidFormat("varint too long".to_string()));
            }
        }
    }

    /// Length-prefixed bytes, rejecting lengths above `max_len`.
    pub fn read_bytes(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let len = self.read_varint()?;
        if len > max_len as u64 {
            return Err(SetupError::InvalidFormat(format!(
                "length {len} exceeds maximum {max_len}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    /// Nullable bounded string.
    pub fn read_string_opt(&mut self, max_len: usize) -> Result<Option<String>> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => {
                let bytes = self.read_bytes(max_len)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| SetupError::InvalidFormat("invalid UTF-8 string".to_string()))?;
                Ok(Some(s))
            }
            other => Err(SetupError::InvalidFormat(format!(
                "invalid string marker: {other}"
            ))),
        }
    }

    /// Non-null bounded string; a null marker is a format error here.
    pub fn read_string(&mut self, max_len: usize) -> Result<String> {
        self.read_string_opt(max_len)?
            .ok_or_else(|| SetupError::InvalidFormat("unexpected null string".to_string()))
    }

    /// Single-byte enum validated against the declared value range.
    pub fn read_enum(&mut self, allowed: RangeInclusive<u8>) -> Result<u8> {
        let value = self.read_u8()?;
        if !allowed.contains(&value) {
            return Err(SetupError::InvalidFormat(format!(
                "invalid enum value: {value}"
            )));
        }
        Ok(value)
    }

    /// Direct access for bulk payload copies between framed fields.
    pub fn reader(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip<F, G, T>(write: F, read: G) -> T
    where
        F: FnOnce(&mut FrameWriter<Vec<u8>>),
        G: FnOnce(&mut FrameReader<Cursor<Vec<u8>>>) -> T,
    {
        let mut w = FrameWriter::new(Vec::new());
        write(&mut w);
        let buf = w.into_inner();
        let mut r = FrameReader::new(Cursor::new(buf));
        read(&mut r)
    }

    #[test]
    fn test_version_roundtrip() {
        let v = roundtrip(
            |w| w.write_version().unwrap(),
            |r| r.read_version().unwrap(),
        );
        assert_eq!(v, WIRE_VERSION);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut r = FrameReader::new(Cursor::new(vec![0xFEu8]));
        assert!(matches!(
            r.read_version(),
            Err(SetupError::UnsupportedFormat(0xFE))
        ));
    }

    #[test]
    fn test_integer_roundtrip() {
        let (a, b, c) = roundtrip(
            |w| {
                w.write_u8(0xAB).unwrap();
                w.write_u64(u64::MAX - 1).unwrap();
                w.write_i64(-42).unwrap();
            },
            |r| {
                (
                    r.read_u8().unwrap(),
                    r.read_u64().unwrap(),
                    r.read_i64().unwrap(),
                )
            },
        );
        assert_eq!(a, 0xAB);
        assert_eq!(b, u64::MAX - 1);
        assert_eq!(c, -42);
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u64::MAX] {
            let got = roundtrip(
                |w| w.write_varint(value).unwrap(),
                |r| r.read_varint().unwrap(),
            );
            assert_eq!(got, value);
        }
    }

    #[test]
    fn test_varint_overflow_rejected() {
        // 10 continuation bytes followed by a value byte: too long.
        let data = vec![0x80u8; 10];
        let mut r = FrameReader::new(Cursor::new(data));
        assert!(r.read_varint().is_err());

        // 10th byte carries bits beyond u64.
        let mut data = vec![0xFFu8; 9];
        data.push(0x02);
        let mut r = FrameReader::new(Cursor::new(data));
        assert!(r.read_varint().is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        let (s, none, empty) = roundtrip(
            |w| {
                w.write_string("hello/wörld").unwrap();
                w.write_string_opt(None).unwrap();
                w.write_string("").unwrap();
            },
            |r| {
                (
                    r.read_string(1024).unwrap(),
                    r.read_string_opt(1024).unwrap(),
                    r.read_string_opt(1024).unwrap(),
                )
            },
        );
        assert_eq!(s, "hello/wörld");
        assert!(none.is_none());
        assert_eq!(empty.as_deref(), Some(""));
    }

    #[test]
    fn test_string_over_limit_rejected() {
        let mut w = FrameWriter::new(Vec::new());
        w.write_string("this is far too long").unwrap();
        let mut r = FrameReader::new(Cursor::new(w.into_inner()));
        assert!(matches!(
            r.read_string(4),
            Err(SetupError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_string_bad_marker_rejected() {
        let mut r = FrameReader::new(Cursor::new(vec![7u8]));
        assert!(r.read_string_opt(16).is_err());
    }

    #[test]
    fn test_string_invalid_utf8_rejected() {
        // marker 1, length 2, invalid UTF-8 bytes
        let mut r = FrameReader::new(Cursor::new(vec![1u8, 2, 0xFF, 0xFE]));
        assert!(r.read_string(16).is_err());
    }

    #[test]
    fn test_enum_validation() {
        let mut w = FrameWriter::new(Vec::new());
        w.write_enum(1).unwrap();
        w.write_enum(9).unwrap();
        let mut r = FrameReader::new(Cursor::new(w.into_inner()));
        assert_eq!(r.read_enum(0..=1).unwrap(), 1);
        assert!(matches!(
            r.read_enum(0..=1),
            Err(SetupError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_truncated_stream_is_invalid_format() {
        let mut r = FrameReader::new(Cursor::new(vec![1u8, 5, b'a']));
        assert!(matches!(
            r.read_string(16),
            Err(SetupError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let data = roundtrip(
            |w| w.write_bytes(&[1, 2, 3, 4, 5]).unwrap(),
            |r| r.read_bytes(64).unwrap(),
        );
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }
}
