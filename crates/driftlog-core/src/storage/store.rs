use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::LEN_WIDTH;

/// Buffered appends are flushed to disk once this many bytes accumulate.
const FLUSH_THRESHOLD: usize = 8 * 1024;

/// Append-only file of length-prefixed payloads.
///
/// Every entry is `[len: u64 BE][payload: len bytes]`. Writes land in an
/// in-memory buffer first; every read path flushes the buffer so a process
/// always sees its own writes.
#[derive(Debug)]
pub struct Store {
    file: File,
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    size: u64,
}

impl Store {
    /// Open or create the store file at `path`. The current file length
    /// becomes the store's size, so reopening resumes where a previous
    /// instance left off.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            file,
            path,
            inner: Mutex::new(Inner {
                buf: Vec::with_capacity(FLUSH_THRESHOLD),
                size,
            }),
        })
    }

    /// Append one payload. Returns the number of bytes written (prefix
    /// included) and the position the entry starts at.
    pub fn append(&self, p: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();

        let pos = inner.size;
        inner.buf.extend_from_slice(&(p.len() as u64).to_be_bytes());
        inner.buf.extend_from_slice(p);

        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;

        if inner.buf.len() >= FLUSH_THRESHOLD {
            self.flush_locked(&mut inner)?;
        }

        Ok((written, pos))
    }

    /// Read the payload of the entry starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        self.file.read_exact_at(&mut len_buf, pos)?;
        let len = u64::from_be_bytes(len_buf);

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;

        Ok(Bytes::from(payload))
    }

    /// Positional read of exactly `buf.len()` bytes at `off`.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    /// Total byte length, buffered writes included.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered writes to the file.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    /// Flush and sync. The file handle itself closes on drop.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        if !inner.buf.is_empty() {
            (&self.file).write_all(&inner.buf)?;
            inner.buf.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WRITE: &[u8] = b"hello world";

    fn width() -> u64 {
        LEN_WIDTH + WRITE.len() as u64
    }

    #[test]
    fn append_then_read() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("append_read.store")).unwrap();

        for i in 1..4u64 {
            let (n, pos) = store.append(WRITE).unwrap();
            assert_eq!(n, width());
            assert_eq!(pos + n, width() * i);
        }

        for i in 0..3u64 {
            let read = store.read(width() * i).unwrap();
            assert_eq!(&read[..], WRITE);
        }
    }

    #[test]
    fn read_at_returns_prefix_and_payload() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("read_at.store")).unwrap();
        store.append(WRITE).unwrap();

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        store.read_at(&mut len_buf, 0).unwrap();
        assert_eq!(u64::from_be_bytes(len_buf), WRITE.len() as u64);

        let mut payload = vec![0u8; WRITE.len()];
        store.read_at(&mut payload, LEN_WIDTH).unwrap();
        assert_eq!(&payload[..], WRITE);
    }

    #[test]
    fn reopen_resumes_at_previous_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.store");

        let store = Store::open(&path).unwrap();
        store.append(WRITE).unwrap();
        store.close().unwrap();
        drop(store);

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), width());
        let read = store.read(0).unwrap();
        assert_eq!(&read[..], WRITE);

        // New appends land after the recovered tail.
        let (_, pos) = store.append(WRITE).unwrap();
        assert_eq!(pos, width());
    }

    #[test]
    fn read_flushes_buffered_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flush.store");
        let store = Store::open(&path).unwrap();

        store.append(WRITE).unwrap();
        // The write is still buffered; the file on disk may be empty.
        let read = store.read(0).unwrap();
        assert_eq!(&read[..], WRITE);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), width());
    }
}
