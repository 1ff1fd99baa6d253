//! Little-endian primitives and tagged chunk framing for snapshot files.
//!
//! Chunk layout:
//! - tag: `[u8; 4]`
//! - len: `u32` (bytes following, including the 4-byte uncompressed length)
//! - uncompressed_len: `u32`
//! - LZ4 block payload

use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"OPSNAP01";

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

/// Returns `Ok(None)` at a clean end of stream.
pub fn read_chunk_lz4<R: Read>(r: &mut R) -> io::Result<Option<([u8; 4], Vec<u8>)>> {
    let tag = match read_exact::<4, _>(r) {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = read_u32_le(r)?;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk shorter than its header",
        ));
    }

    let mut take = r.take(u64::from(len));
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunk",
        ));
    }
    let payload = decompress_lz4(&compressed, uncompressed_len)?;
    Ok(Some((tag, payload)))
}
