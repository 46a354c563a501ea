//! Varint and length-prefixed byte-string codec.
//!
//! # Invariants
//! - Encoding is the protobuf unsigned varint form: low 7 bits per byte,
//!   bit 7 set on every byte except the last. A `u64` occupies 1-10 bytes.
//! - Decoding is strict: truncated input, more than 10 bytes, payload bits
//!   beyond 64, and non-canonical (overlong) encodings are all rejected as
//!   data-integrity errors.
//!
//! Composite records elsewhere in the crate are plain concatenations of
//! varints and length-prefixed byte strings built from these primitives.
//! Varints keep small values (early source-ids, block-aligned offsets divided
//! by the block size) to a single byte, which dominates storage after the
//! block hashes themselves.

use crate::error::{Error, Result};

/// Maximum encoded length of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `out` as a varint. Returns the number of bytes written.
pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) -> usize {
    let mut written = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        written += 1;
        if value == 0 {
            out.push(byte);
            return written;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes one varint from the front of `input`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_u64(input: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in input.iter().take(MAX_VARINT_LEN).enumerate() {
        let payload = u64::from(byte & 0x7f);
        // The 10th byte may only carry the single remaining high bit.
        if i == MAX_VARINT_LEN - 1 && payload > 1 {
            return Err(Error::DataIntegrity("varint exceeds 64 bits".into()));
        }
        value |= payload << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(Error::DataIntegrity("overlong varint encoding".into()));
            }
            return Ok((value, i + 1));
        }
    }
    if input.len() < MAX_VARINT_LEN {
        Err(Error::DataIntegrity("truncated varint".into()))
    } else {
        Err(Error::DataIntegrity("varint exceeds 10 bytes".into()))
    }
}

/// Appends a length-prefixed byte string. Returns the number of bytes written.
pub fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) -> usize {
    let n = encode_u64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
    n + bytes.len()
}

/// Decodes one length-prefixed byte string from the front of `input`.
///
/// Returns the string and the number of bytes consumed.
pub fn decode_bytes(input: &[u8]) -> Result<(&[u8], usize)> {
    let (len, n) = decode_u64(input)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::DataIntegrity("byte-string length exceeds address space".into()))?;
    let end = n
        .checked_add(len)
        .ok_or_else(|| Error::DataIntegrity("byte-string length overflow".into()))?;
    if input.len() < end {
        return Err(Error::DataIntegrity("truncated byte string".into()));
    }
    Ok((&input[n..end], end))
}

/// Decodes a length-prefixed UTF-8 string.
pub fn decode_string(input: &[u8]) -> Result<(String, usize)> {
    let (bytes, n) = decode_bytes(input)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::DataIntegrity("byte string is not valid UTF-8".into()))?;
    Ok((s.to_owned(), n))
}
