use crate::{Config, Error, Record, Result};
use parking_lot::RwLock;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Segment, Store};

/// The commit log: an ordered, non-empty list of segments, the last of
/// which is active. One readers-writer lock gates every operation; the
/// throughput-limiting step is the single active segment, so finer locking
/// buys nothing here.
#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    config: Config,
    segments: RwLock<Vec<Segment>>,
}

impl Log {
    /// Open the log over `dir`, creating it if needed. Existing segments
    /// are rebuilt from the files on disk; an empty directory gets a single
    /// segment at the configured initial offset.
    pub fn new(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        let config = config.normalized();
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log = Self {
            dir,
            config,
            segments: RwLock::new(Vec::new()),
        };
        log.setup()?;
        Ok(log)
    }

    /// Scan the directory for segment files, parse their base offsets, and
    /// re-instantiate every segment in ascending order. Each base offset
    /// appears twice on disk (`.store` and `.index`), hence the dedup.
    fn setup(&self) -> Result<()> {
        let mut base_offsets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(off) = stem.parse::<u64>() {
                base_offsets.push(off);
            }
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in base_offsets {
            segments.push(Segment::open(&self.dir, base, self.config.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(
                &self.dir,
                self.config.segment.initial_offset,
                self.config.clone(),
            )?);
        }

        *self.segments.write() = segments;
        Ok(())
    }

    /// Append a record to the active segment, rolling over to a fresh
    /// segment once the active one reports itself maxed. Returns the
    /// assigned offset.
    pub fn append(&self, record: &mut Record) -> Result<u64> {
        let mut segments = self.segments.write();
        let active = segments
            .last_mut()
            .expect("log always holds at least one segment");

        let offset = active.append(record)?;

        if active.is_maxed() {
            let next = Segment::open(&self.dir, offset + 1, self.config.clone())?;
            segments.push(next);
        }

        Ok(offset)
    }

    /// Read the record at `offset`, or fail with
    /// [`Error::OffsetOutOfRange`] when no segment covers it.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let segments = self.segments.read();
        let segment = segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset())
            .ok_or(Error::OffsetOutOfRange { offset })?;
        segment.read(offset)
    }

    /// Close every segment in order. The on-disk index files shrink to
    /// their logical sizes so a reopen can recover the tail.
    pub fn close(&self) -> Result<()> {
        let mut segments = self.segments.write();
        for segment in segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its entire data directory.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        tracing::debug!(dir = %self.dir.display(), "removing log directory");
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Close and re-run setup over whatever remains on disk.
    pub fn reset(&self) -> Result<()> {
        self.close()?;
        self.setup()
    }

    pub fn lowest_offset(&self) -> u64 {
        let segments = self.segments.read();
        segments
            .first()
            .expect("log always holds at least one segment")
            .base_offset()
    }

    pub fn highest_offset(&self) -> u64 {
        let segments = self.segments.read();
        let next = segments
            .last()
            .expect("log always holds at least one segment")
            .next_offset();
        next.saturating_sub(1)
    }

    /// Drop every segment whose records all fall at or below `lowest`.
    /// Used to reclaim disk once consumers no longer need old records.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut segments = self.segments.write();

        let mut retained = Vec::with_capacity(segments.len());
        for segment in segments.drain(..) {
            if segment.next_offset() <= lowest + 1 {
                tracing::debug!(
                    base_offset = segment.base_offset(),
                    "truncating segment"
                );
                segment.remove()?;
            } else {
                retained.push(segment);
            }
        }

        // Keep the log non-empty: if truncation consumed every segment,
        // start a fresh one where the log would resume.
        if retained.is_empty() {
            retained.push(Segment::open(&self.dir, lowest + 1, self.config.clone())?);
        }

        *segments = retained;
        Ok(())
    }

    /// A reader over the raw store bytes of every segment, in offset
    /// order: a concatenation of `[u64 BE len][payload]` frames. Snapshots
    /// the segment set and sizes at call time.
    pub fn reader(&self) -> LogReader {
        let segments = self.segments.read();
        let stores = segments
            .iter()
            .map(|s| {
                let store = s.store();
                let size = store.size();
                StoreSlice {
                    store,
                    pos: 0,
                    size,
                }
            })
            .collect();
        LogReader { stores, current: 0 }
    }
}

/// Sequential reader over the concatenated store files of a log snapshot.
#[derive(Debug)]
pub struct LogReader {
    stores: Vec<StoreSlice>,
    current: usize,
}

#[derive(Debug)]
struct StoreSlice {
    store: Arc<Store>,
    pos: u64,
    size: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while let Some(slice) = self.stores.get_mut(self.current) {
            if slice.pos >= slice.size {
                self.current += 1;
                continue;
            }

            let n = (slice.size - slice.pos).min(buf.len() as u64) as usize;
            slice
                .store
                .read_at(&mut buf[..n], slice.pos)
                .map_err(|e| match e {
                    Error::Io(io_err) => io_err,
                    other => io::Error::new(io::ErrorKind::Other, other),
                })?;
            slice.pos += n as u64;
            return Ok(n);
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LEN_WIDTH;
    use crate::SegmentConfig;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn small_segment_config() -> Config {
        Config {
            segment: SegmentConfig {
                max_store_bytes: 32,
                max_index_bytes: 0,
                initial_offset: 0,
            },
        }
    }

    fn hello() -> Bytes {
        Bytes::from_static(b"hello world")
    }

    #[test]
    fn append_and_read_a_record() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        let mut record = Record::new(hello());
        let off = log.append(&mut record).unwrap();
        assert_eq!(off, 0);

        let read = log.read(off).unwrap();
        assert_eq!(read.value, hello());
        assert_eq!(read.offset, off);
    }

    #[test]
    fn offsets_are_contiguous_and_segments_roll() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for want in 0..3u64 {
            let off = log.append(&mut Record::new(hello())).unwrap();
            assert_eq!(off, want);
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);

        // The 32-byte store cap forces at least two segments on disk.
        let stores = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "store"))
            .count();
        assert!(stores >= 2, "expected rollover, found {stores} store files");
    }

    #[test]
    fn offset_out_of_bounds_errors() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        log.append(&mut Record::new(hello())).unwrap();

        let err = log.read(1).unwrap_err();
        assert!(matches!(err, Error::OffsetOutOfRange { offset: 1 }));

        // An empty log rejects every offset the same way.
        let empty_dir = TempDir::new().unwrap();
        let empty = Log::new(empty_dir.path(), small_segment_config()).unwrap();
        assert!(empty.read(0).unwrap_err().is_offset_out_of_range());
    }

    #[test]
    fn reopen_preserves_offsets_and_records() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for _ in 0..3 {
            log.append(&mut Record::new(hello())).unwrap();
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        log.close().unwrap();
        drop(log);

        let log = Log::new(dir.path(), small_segment_config()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        for off in 0..3 {
            let record = log.read(off).unwrap();
            assert_eq!(record.value, hello());
            assert_eq!(record.offset, off);
        }
    }

    #[test]
    fn reader_yields_raw_frames_in_order() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        let mut record = Record::new(hello());
        let off = log.append(&mut record).unwrap();
        assert_eq!(off, 0);

        let mut bytes = Vec::new();
        log.reader().read_to_end(&mut bytes).unwrap();

        // Skip the length prefix and unmarshal what remains.
        let read = Record::from_bytes(&bytes[LEN_WIDTH as usize..]).unwrap();
        assert_eq!(read.value, hello());
        assert_eq!(read.offset, 0);
    }

    #[test]
    fn reader_spans_segments() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for _ in 0..3 {
            log.append(&mut Record::new(hello())).unwrap();
        }

        let mut bytes = Vec::new();
        log.reader().read_to_end(&mut bytes).unwrap();

        let mut cursor = 0usize;
        let mut offsets = Vec::new();
        while cursor + LEN_WIDTH as usize <= bytes.len() {
            let len = u64::from_be_bytes(
                bytes[cursor..cursor + LEN_WIDTH as usize].try_into().unwrap(),
            ) as usize;
            cursor += LEN_WIDTH as usize;
            let record = Record::from_bytes(&bytes[cursor..cursor + len]).unwrap();
            assert_eq!(record.value, hello());
            offsets.push(record.offset);
            cursor += len;
        }
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(cursor, bytes.len());
    }

    #[test]
    fn truncate_drops_early_segments() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for _ in 0..3 {
            log.append(&mut Record::new(hello())).unwrap();
        }

        log.truncate(1).unwrap();

        assert!(log.read(0).is_err());
        assert!(log.read(2).is_ok());
        assert!(log.lowest_offset() >= 1);
    }

    #[test]
    fn truncate_everything_leaves_a_usable_log() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for _ in 0..3 {
            log.append(&mut Record::new(hello())).unwrap();
        }

        // lowest = highest: every segment is eligible for removal.
        log.truncate(log.highest_offset()).unwrap();
        let off = log.append(&mut Record::new(hello())).unwrap();
        assert_eq!(off, log.highest_offset());
        assert!(log.read(off).is_ok());
    }

    #[test]
    fn reset_reopens_from_disk() {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config()).unwrap();

        for _ in 0..3 {
            log.append(&mut Record::new(hello())).unwrap();
        }
        log.reset().unwrap();

        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.read(1).unwrap().value, hello());
    }

    #[test]
    fn remove_deletes_the_directory() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("log");
        let log = Log::new(&data_dir, small_segment_config()).unwrap();
        log.append(&mut Record::new(hello())).unwrap();

        log.remove().unwrap();
        assert!(!data_dir.exists());
    }

    #[test]
    fn initial_offset_seeds_the_first_segment() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            segment: SegmentConfig {
                max_store_bytes: 1024,
                max_index_bytes: 1024,
                initial_offset: 100,
            },
        };
        let log = Log::new(dir.path(), config).unwrap();

        let off = log.append(&mut Record::new(hello())).unwrap();
        assert_eq!(off, 100);
        assert_eq!(log.lowest_offset(), 100);
        assert!(log.read(0).unwrap_err().is_offset_out_of_range());
    }
}
