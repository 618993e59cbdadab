//! Streaming SHA-256 helpers.
//!
//! Everything here reads or writes in fixed 64 KiB chunks so that hashing a
//! multi-gigabyte archive never holds more than one chunk in memory. The
//! [`HashingWriter`] is the write-through sink the archive builder interposes
//! between the gzip encoder and the output file; [`HashingReader`] is its
//! read-side twin used to digest file contents while tar consumes them.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Chunk size for all streaming digest computation.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// A write-through sink that forwards bytes to an inner writer while feeding
/// a running SHA-256. No buffering of its own: every byte accepted by the
/// inner writer updates the digest exactly once.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Option<Sha256>,
    bytes_written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`, computing a digest of everything written through.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            bytes_written: 0,
        }
    }

    /// Wrap `inner` without computing a digest. Bytes pass straight through;
    /// `finalize` returns `None` for the digest.
    pub fn passthrough(inner: W) -> Self {
        Self {
            inner,
            hasher: None,
            bytes_written: 0,
        }
    }

    /// Consume the sink, returning the inner writer, the hex digest (if
    /// enabled) and the total number of bytes written through.
    pub fn finalize(self) -> (W, Option<String>, u64) {
        let digest = self.hasher.map(|h| format!("{:x}", h.finalize()));
        (self.inner, digest, self.bytes_written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read-side counterpart of [`HashingWriter`]: digests bytes as a consumer
/// pulls them, so file content is read exactly once during a build.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Hex digest of everything read so far.
    pub fn finalize(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// SHA-256 of a file on disk, streamed in fixed chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let (digest, _) = sha256_reader(&mut file)?;
    Ok(digest)
}

/// SHA-256 of everything a reader yields. Returns the hex digest and the
/// number of bytes consumed.
pub fn sha256_reader<R: Read>(reader: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// SHA-256 of an in-memory byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
