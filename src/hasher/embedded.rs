//! Embedded-stream sniffing for recursive scanning.
//!
//! # Invariants
//! - Detection is signature-based and position-independent: a gzip member
//!   or zip local-file entry is recognized at any byte offset inside a scan
//!   buffer, the way carved media actually presents them.
//! - Inflation is bounded per stream and per buffer; a hostile archive can
//!   waste at most the configured budget.
//! - A signature that fails to inflate is skipped silently. False
//!   positives on four magic bytes are routine in binary media.
//!
//! Only deflate-based containers are recognized: standalone gzip members
//! and zip local entries that are stored or deflated. Other formats are
//! left to the windows of the outer scan.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};
use memchr::memmem;

/// gzip member magic plus the deflate compression method byte.
const GZIP_SIG: [u8; 3] = [0x1f, 0x8b, 0x08];
/// zip local-file-header signature.
const ZIP_LFH_SIG: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
/// zip local-file-header fixed length.
const ZIP_LFH_LEN: usize = 30;

/// zip compression methods we can expand.
const ZIP_METHOD_STORED: u16 = 0;
const ZIP_METHOD_DEFLATED: u16 = 8;

/// One inflated embedded stream found inside a scan buffer.
pub struct EmbeddedStream {
    /// Container kind: `"gzip"` or `"zip"`.
    pub kind: &'static str,
    /// Byte offset of the container signature within the scanned region.
    pub offset: usize,
    /// Inflated payload, truncated to the per-stream budget.
    pub data: Vec<u8>,
}

/// Scans a buffer for container signatures and inflates each hit.
///
/// Signatures are searched only within `buffer[..search_limit]` (a chunk's
/// data region; anything later belongs to the next chunk), while inflation
/// runs over the rest of the buffer so a stream starting near the region's
/// end can use the trailing overlap. `max_streams` bounds how many streams
/// one buffer may spawn and `max_stream_bytes` bounds the inflated size of
/// each.
pub fn find_embedded_streams(
    buffer: &[u8],
    search_limit: usize,
    max_streams: usize,
    max_stream_bytes: usize,
) -> Vec<EmbeddedStream> {
    let mut streams = Vec::new();
    let region = &buffer[..search_limit.min(buffer.len())];

    for offset in memmem::find_iter(region, &GZIP_SIG) {
        if streams.len() >= max_streams {
            return streams;
        }
        let payload = inflate_bounded(GzDecoder::new(&buffer[offset..]), max_stream_bytes);
        if !payload.is_empty() {
            streams.push(EmbeddedStream {
                kind: "gzip",
                offset,
                data: payload,
            });
        }
    }

    for offset in memmem::find_iter(region, &ZIP_LFH_SIG) {
        if streams.len() >= max_streams {
            return streams;
        }
        if let Some(payload) = expand_zip_entry(&buffer[offset..], max_stream_bytes) {
            streams.push(EmbeddedStream {
                kind: "zip",
                offset,
                data: payload,
            });
        }
    }

    streams
}

/// Expands the payload of one zip local-file entry starting at its
/// signature. Returns `None` for entries we cannot or should not expand.
fn expand_zip_entry(entry: &[u8], max_stream_bytes: usize) -> Option<Vec<u8>> {
    if entry.len() < ZIP_LFH_LEN {
        return None;
    }
    let method = u16::from_le_bytes([entry[8], entry[9]]);
    let compressed_size = u32::from_le_bytes([entry[18], entry[19], entry[20], entry[21]]) as usize;
    let name_len = u16::from_le_bytes([entry[26], entry[27]]) as usize;
    let extra_len = u16::from_le_bytes([entry[28], entry[29]]) as usize;

    let payload_start = ZIP_LFH_LEN + name_len + extra_len;
    if payload_start > entry.len() {
        return None;
    }
    let payload = &entry[payload_start..];

    match method {
        ZIP_METHOD_STORED => {
            if compressed_size == 0 || compressed_size > payload.len() {
                return None;
            }
            let take = compressed_size.min(max_stream_bytes);
            Some(payload[..take].to_vec())
        }
        ZIP_METHOD_DEFLATED => {
            let inflated = inflate_bounded(DeflateDecoder::new(payload), max_stream_bytes);
            if inflated.is_empty() {
                None
            } else {
                Some(inflated)
            }
        }
        _ => None,
    }
}

/// Reads from a decoder until end, error, or the byte budget. Bytes decoded
/// before an error are kept; a signature false-positive typically fails on
/// the first read with nothing decoded.
fn inflate_bounded<R: Read>(mut decoder: R, max_bytes: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    while out.len() < max_bytes {
        let want = chunk.len().min(max_bytes - out.len());
        match decoder.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn gzip_member(content: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(content).unwrap();
        enc.finish().unwrap()
    }

    fn zip_entry_deflated(name: &[u8], content: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(content).unwrap();
        let deflated = enc.finish().unwrap();

        let mut out = Vec::new();
        out.extend_from_slice(&ZIP_LFH_SIG);
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&ZIP_METHOD_DEFLATED.to_le_bytes());
        out.extend_from_slice(&[0; 4]); // time + date
        out.extend_from_slice(&[0; 4]); // crc32, unchecked on expand
        out.extend_from_slice(&(deflated.len() as u32).to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // extra len
        out.extend_from_slice(name);
        out.extend_from_slice(&deflated);
        out
    }

    #[test]
    fn finds_gzip_member_mid_buffer() {
        let mut buffer = vec![0x11u8; 1000];
        buffer.extend_from_slice(&gzip_member(b"hidden payload bytes"));
        buffer.extend_from_slice(&[0x22; 500]);

        let streams = find_embedded_streams(&buffer, buffer.len(), 8, 1 << 20);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].kind, "gzip");
        assert_eq!(streams[0].offset, 1000);
        assert_eq!(streams[0].data, b"hidden payload bytes");
    }

    #[test]
    fn finds_zip_entry_and_inflates_it() {
        let mut buffer = vec![0xaau8; 64];
        buffer.extend_from_slice(&zip_entry_deflated(b"doc.txt", b"zip entry content here"));

        let streams = find_embedded_streams(&buffer, buffer.len(), 8, 1 << 20);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].kind, "zip");
        assert_eq!(streams[0].offset, 64);
        assert_eq!(streams[0].data, b"zip entry content here");
    }

    #[test]
    fn false_positive_magic_is_skipped() {
        let mut buffer = vec![0u8; 256];
        buffer[10] = 0x1f;
        buffer[11] = 0x8b;
        buffer[12] = 0x08;
        // Bytes after the magic do not form a valid gzip header/stream.
        buffer[13] = 0xff;
        let streams = find_embedded_streams(&buffer, buffer.len(), 8, 1 << 20);
        assert!(streams.is_empty());
    }

    #[test]
    fn stream_budget_truncates_output() {
        let big = vec![0x55u8; 100_000];
        let buffer = gzip_member(&big);
        let streams = find_embedded_streams(&buffer, buffer.len(), 8, 1024);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].data.len(), 1024);
    }

    #[test]
    fn stream_count_budget_is_enforced() {
        let mut buffer = Vec::new();
        for i in 0..5u8 {
            buffer.extend_from_slice(&gzip_member(&[i; 32]));
            buffer.extend_from_slice(&[0; 16]);
        }
        let streams = find_embedded_streams(&buffer, buffer.len(), 3, 1 << 20);
        assert_eq!(streams.len(), 3);
    }

    #[test]
    fn stored_zip_entry_is_copied() {
        let content = b"stored, not deflated";
        let mut out = Vec::new();
        out.extend_from_slice(&ZIP_LFH_SIG);
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&ZIP_METHOD_STORED.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(b"a.ic");
        out.extend_from_slice(content);

        let streams = find_embedded_streams(&out, out.len(), 8, 1 << 20);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].data, content);
    }
}
