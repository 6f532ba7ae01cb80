use crate::{Config, Error, Record, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Index, Store, INDEX_SUFFIX, STORE_SUFFIX};

/// One store file and one index file covering the contiguous offset range
/// `[base_offset, next_offset)`.
#[derive(Debug)]
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: Config,
}

impl Segment {
    /// Open or create the segment for `base_offset` inside `dir`.
    ///
    /// `next_offset` is rebuilt from the last index entry; an empty index
    /// means the segment holds nothing yet.
    pub fn open(dir: impl AsRef<Path>, base_offset: u64, config: Config) -> Result<Self> {
        let dir = dir.as_ref();
        let store = Arc::new(Store::open(segment_path(dir, base_offset, STORE_SUFFIX))?);
        let index = Index::open(
            segment_path(dir, base_offset, INDEX_SUFFIX),
            config.segment.max_index_bytes,
        )?;

        let next_offset = match index.read(-1) {
            Ok((rel_off, _)) => base_offset + u64::from(rel_off) + 1,
            Err(Error::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Append one record. The record's offset field is overwritten with the
    /// assigned offset, which is also returned.
    ///
    /// On any failure `next_offset` is left unchanged. A store append that
    /// succeeds before a failing index write leaves an un-indexed tail in
    /// the store; the region is never addressed and is reclaimed when the
    /// segment is removed.
    pub fn append(&mut self, record: &mut Record) -> Result<u64> {
        let offset = self.next_offset;
        record.offset = offset;

        let bytes = record.to_bytes()?;
        let (_, pos) = self.store.append(&bytes)?;
        self.index
            .write((offset - self.base_offset) as u32, pos)?;

        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record at an absolute log offset. The caller is expected to
    /// have range-checked `offset` against this segment.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let bytes = self.store.read(pos)?;
        Record::from_bytes(&bytes)
    }

    /// A maxed segment accepts no further appends; the log rolls over to a
    /// fresh one.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.segment.max_store_bytes
            || self.index.size() >= self.config.segment.max_index_bytes
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The next offset this segment would assign.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Handle to the underlying store, for the log's raw reader.
    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Close the segment and unlink its files.
    pub fn remove(mut self) -> Result<()> {
        self.close()?;
        let index_path = self.index.path().to_path_buf();
        let store_path = self.store.path().to_path_buf();
        fs::remove_file(index_path)?;
        fs::remove_file(store_path)?;
        Ok(())
    }

    /// Close index first (msync + truncate), then flush the store.
    pub fn close(&mut self) -> Result<()> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }
}

fn segment_path(dir: &Path, base_offset: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{base_offset}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentConfig;
    use bytes::Bytes;
    use tempfile::TempDir;

    use crate::storage::ENTRY_WIDTH;

    fn config(max_store_bytes: u64, max_index_bytes: u64) -> Config {
        Config {
            segment: SegmentConfig {
                max_store_bytes,
                max_index_bytes,
                initial_offset: 0,
            },
        }
    }

    #[test]
    fn append_read_and_index_exhaustion() {
        let dir = TempDir::new().unwrap();
        let want = Bytes::from_static(b"hello world");

        // Room for exactly three index entries.
        let mut segment = Segment::open(dir.path(), 16, config(1024, 3 * ENTRY_WIDTH)).unwrap();
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let mut record = Record::new(want.clone());
            let off = segment.append(&mut record).unwrap();
            assert_eq!(off, 16 + i);
            assert_eq!(record.offset, off);

            let got = segment.read(off).unwrap();
            assert_eq!(got.value, want);
            assert_eq!(got.offset, off);
        }

        let mut record = Record::new(want.clone());
        assert!(matches!(segment.append(&mut record), Err(Error::IndexFull)));
        assert!(segment.is_maxed());
    }

    #[test]
    fn store_cap_maxes_segment() {
        let dir = TempDir::new().unwrap();
        let want = Bytes::from_static(b"hello world");

        let mut segment = Segment::open(dir.path(), 16, config(1024, 3 * ENTRY_WIDTH)).unwrap();
        for _ in 0..3 {
            segment.append(&mut Record::new(want.clone())).unwrap();
        }
        let written = segment.store.size();
        segment.close().unwrap();

        // Reopen with a store cap at or below what is already written.
        let segment = Segment::open(dir.path(), 16, config(written, 1024)).unwrap();
        assert!(segment.is_maxed());
        assert_eq!(segment.next_offset(), 19);
    }

    #[test]
    fn remove_unlinks_files() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 16, config(1024, 1024)).unwrap();
        segment
            .append(&mut Record::new(Bytes::from_static(b"hello world")))
            .unwrap();
        segment.remove().unwrap();

        let segment = Segment::open(dir.path(), 16, config(1024, 1024)).unwrap();
        assert!(!segment.is_maxed());
        assert_eq!(segment.next_offset(), 16);
    }

    #[test]
    fn reopen_recovers_next_offset() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 5, config(1024, 1024)).unwrap();
        for _ in 0..2 {
            segment
                .append(&mut Record::new(Bytes::from_static(b"x")))
                .unwrap();
        }
        segment.close().unwrap();
        drop(segment);

        let segment = Segment::open(dir.path(), 5, config(1024, 1024)).unwrap();
        assert_eq!(segment.next_offset(), 7);
        assert_eq!(segment.read(6).unwrap().offset, 6);
    }
}
