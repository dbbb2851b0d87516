/// Brotli compression envelope around the package body.
///
/// Layout: `[version | flags | uncompressed_len (when flagged) | brotli
/// stream]`. The algorithm identifier is omitted on the wire because the
/// format hard-codes Brotli; flag bit 1 records that omission. The
/// uncompressed length travels ahead of the body so extractors can show
/// progress and pre-allocate.
///
/// Decompression is streaming: readers get the parsed header plus a
/// `Read`-based decompressor over the rest of the input, never a fully
/// buffered body.
use std::io::{Read, Write};

use crate::error::{Result, SetupError};
use crate::wire::{FrameReader, FrameWriter};

/// Bit 0: the header carries the uncompressed length.
pub const FLAG_UNCOMPRESSED_LEN: u8 = 0b0000_0001;
/// Bit 1: algorithm identifier absent because the format fixes Brotli.
pub const FLAG_FIXED_ALGORITHM: u8 = 0b0000_0010;

const KNOWN_FLAGS: u8 = FLAG_UNCOMPRESSED_LEN | FLAG_FIXED_ALGORITHM;

const BROTLI_BUFFER_SIZE: usize = 4096;
/// "Optimal" compression level.
const BROTLI_QUALITY: u32 = 11;
const BROTLI_LG_WINDOW: u32 = 22;

/// Parsed envelope header.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub flags: u8,
    pub uncompressed_len: Option<u64>,
}

/// Compress `body` into `out` behind an envelope header.
///
/// `uncompressed_len` must be the exact byte count `body` will yield; the
/// two-pass package writer measures it before calling here.
pub fn write_envelope<R: Read, W: Write>(
    body: &mut R,
    out: W,
    uncompressed_len: u64,
) -> Result<()> {
    let mut frame = FrameWriter::new(out);
    frame.write_version()?;
    frame.write_u8(FLAG_UNCOMPRESSED_LEN | FLAG_FIXED_ALGORITHM)?;
    frame.write_u64(uncompressed_len)?;

    let mut compressor = brotli::CompressorWriter::new(
        frame.into_inner(),
        BROTLI_BUFFER_SIZE,
        BROTLI_QUALITY,
        BROTLI_LG_WINDOW,
    );
    std::io::copy(body, &mut compressor)?;
    compressor.flush()?;
    Ok(())
}

/// Read the envelope header and hand back a streaming decompressor over the
/// remaining input.
pub fn read_envelope<R: Read>(source: R) -> Result<(EnvelopeHeader, brotli::Decompressor<R>)> {
    let mut frame = FrameReader::new(source);
    let version = frame.read_version()?;
    let flags = frame.read_u8()?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(SetupError::InvalidFormat(format!(
            "unknown envelope flags: {flags:#010b}"
        )));
    }

    let uncompressed_len = if flags & FLAG_UNCOMPRESSED_LEN != 0 {
        Some(frame.read_u64()?)
    } else {
        None
    };

    let header = EnvelopeHeader {
        version,
        flags,
        uncompressed_len,
    };
    let decompressor = brotli::Decompressor::new(frame.into_inner(), BROTLI_BUFFER_SIZE);
    Ok((header, decompressor))
}
