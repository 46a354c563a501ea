//! TCP hash-count query server.
//!
//! # Wire format
//!
//! All integers are little-endian; nothing depends on host memory layout.
//!
//! ```text
//! request:  u32 body_len, body = {
//!             u32 hashdigest_type        matches the database algorithm id
//!             u32 count
//!             count x { u64 client_id, hash[digest_len] }
//!           }
//! response: u32 count
//!           count x { u64 client_id, u32 count }
//! ```
//!
//! Response entries preserve request order. A request with a mismatched
//! `hashdigest_type` or inconsistent framing is rejected by closing the
//! connection; the client sees EOF instead of a partial answer.
//!
//! Connections are served one thread each; hashing clients are few and
//! long-lived, so thread-per-connection keeps the server free of shared
//! mutable state.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::error::{Error, Result};
use crate::scan::ScanManager;
use crate::HashDb;

/// Largest accepted request body. Bounds per-connection memory.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// A bound hash-count server, not yet serving.
pub struct HashServer {
    listener: TcpListener,
    scan: Arc<ScanManager>,
    wire_id: u32,
    digest_len: usize,
}

impl HashServer {
    /// Opens the database read-only and binds the listening socket.
    pub fn bind(hashdb_dir: &std::path::Path, addr: &str) -> Result<Self> {
        let db = HashDb::open_read(hashdb_dir)?;
        let wire_id = db.settings().digest_algorithm.wire_id();
        let digest_len = db.settings().digest_len as usize;
        let scan = Arc::new(db.scan_manager()?);
        let listener = TcpListener::bind(addr)
            .map_err(|e| Error::Io(format!("cannot bind '{addr}': {e}")))?;
        Ok(Self {
            listener,
            scan,
            wire_id,
            digest_len,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the process exits.
    pub fn serve(self) -> Result<()> {
        tracing::info!("hash server listening on {:?}", self.listener.local_addr());
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let scan = Arc::clone(&self.scan);
                    let wire_id = self.wire_id;
                    let digest_len = self.digest_len;
                    thread::Builder::new()
                        .name("hash-server-conn".into())
                        .spawn(move || {
                            if let Err(err) = serve_connection(stream, &scan, wire_id, digest_len) {
                                tracing::debug!("connection closed: {err}");
                            }
                        })
                        .map_err(|e| Error::Io(format!("cannot spawn connection thread: {e}")))?;
                }
                Err(err) => tracing::warn!("accept failed: {err}"),
            }
        }
        Ok(())
    }
}

fn serve_connection(
    mut stream: TcpStream,
    scan: &ScanManager,
    wire_id: u32,
    digest_len: usize,
) -> Result<()> {
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes) {
            Ok(()) => {}
            // Clean end of the request stream.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if body_len > MAX_REQUEST_BODY {
            return Err(Error::User(format!(
                "request body of {body_len} bytes exceeds the limit"
            )));
        }
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body)?;

        let response = process_request(scan, wire_id, digest_len, &body)?;
        stream.write_all(&response)?;
    }
}

/// Parses one request body and produces the response bytes.
pub fn process_request(
    scan: &ScanManager,
    wire_id: u32,
    digest_len: usize,
    body: &[u8],
) -> Result<Vec<u8>> {
    if body.len() < 8 {
        return Err(Error::User("request body shorter than its header".into()));
    }
    let request_type = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if request_type != wire_id {
        return Err(Error::User(format!(
            "hashdigest type {request_type} does not match database type {wire_id}"
        )));
    }
    let count = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let entry_len = 8 + digest_len;
    if body.len() != 8 + count * entry_len {
        return Err(Error::User(format!(
            "request frame of {} bytes does not hold {count} entries",
            body.len()
        )));
    }

    let mut response = Vec::with_capacity(4 + count * 12);
    response.extend_from_slice(&(count as u32).to_le_bytes());
    for i in 0..count {
        let entry = &body[8 + i * entry_len..8 + (i + 1) * entry_len];
        let client_id = u64::from_le_bytes([
            entry[0], entry[1], entry[2], entry[3], entry[4], entry[5], entry[6], entry[7],
        ]);
        let hash = &entry[8..];
        let matches = scan.find_hash_count(hash)?;
        let matches = u32::try_from(matches).unwrap_or(u32::MAX);
        response.extend_from_slice(&client_id.to_le_bytes());
        response.extend_from_slice(&matches.to_le_bytes());
    }
    Ok(response)
}
