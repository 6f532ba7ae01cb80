use crate::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::{ENTRY_WIDTH, OFF_WIDTH};

/// Memory-mapped table of fixed-width entries mapping a record's relative
/// offset to its position in the store file.
///
/// The backing file is extended to `max_bytes` before mapping so the
/// mapping never has to grow. On close it is truncated back to the logical
/// size; a reopen then finds the true tail entry and can derive the next
/// offset from it.
#[derive(Debug)]
pub struct Index {
    file: File,
    path: PathBuf,
    mmap: Option<MmapMut>,
    size: u64,
}

impl Index {
    /// Open or create the index at `path`, sized to `max_bytes`.
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        // Logical size is whatever a clean close left behind.
        let size = file.metadata()?.len();

        file.set_len(max_bytes)?;
        // SAFETY: the file stays open for the lifetime of the mapping and
        // is only resized again after the mapping is dropped in `close`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            path,
            mmap: Some(mmap),
            size,
        })
    }

    /// Read entry `n`. `-1` means the last entry.
    pub fn read(&self, n: i64) -> Result<(u32, u64)> {
        let mmap = self.mmap.as_ref().ok_or_else(closed)?;

        if self.size == 0 {
            return Err(Error::EndOfIndex);
        }

        let entry = if n == -1 {
            self.size / ENTRY_WIDTH - 1
        } else {
            n as u64
        };

        let pos = entry * ENTRY_WIDTH;
        if self.size < pos + ENTRY_WIDTH {
            return Err(Error::EndOfIndex);
        }

        let pos = pos as usize;
        let off_end = pos + OFF_WIDTH as usize;
        let entry_end = pos + ENTRY_WIDTH as usize;

        let mut off_buf = [0u8; 4];
        off_buf.copy_from_slice(&mmap[pos..off_end]);
        let mut pos_buf = [0u8; 8];
        pos_buf.copy_from_slice(&mmap[off_end..entry_end]);

        Ok((u32::from_be_bytes(off_buf), u64::from_be_bytes(pos_buf)))
    }

    /// Append one entry. Fails with [`Error::IndexFull`] once the mapping
    /// cannot hold another.
    pub fn write(&mut self, rel_off: u32, store_pos: u64) -> Result<()> {
        let size = self.size;
        let mmap = self.mmap.as_mut().ok_or_else(closed)?;

        if (mmap.len() as u64) < size + ENTRY_WIDTH {
            return Err(Error::IndexFull);
        }

        let pos = size as usize;
        let off_end = pos + OFF_WIDTH as usize;
        let entry_end = pos + ENTRY_WIDTH as usize;

        mmap[pos..off_end].copy_from_slice(&rel_off.to_be_bytes());
        mmap[off_end..entry_end].copy_from_slice(&store_pos.to_be_bytes());

        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Logical size in bytes: entries written, not mapped capacity.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the mapping and the file, drop the mapping, then truncate the
    /// file to the logical size. The order matters: unmap before truncate,
    /// truncate before the handle closes on drop. Safe to call twice.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
            self.file.sync_all()?;
            drop(mmap);
            self.file.set_len(self.size)?;
        }
        Ok(())
    }
}

fn closed() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, "index is closed"))
}
