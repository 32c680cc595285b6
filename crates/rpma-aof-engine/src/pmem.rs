//! Persistence collaborator used by the server to make ranges durable.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

/// Synchronous durability primitive over the server workspace.
///
/// `data` is the current content of `[offset, offset + data.len())`; the call
/// returns only once that range is durable.
pub trait PersistentMemory: Send + Sync {
    /// Make the range durable.
    fn flush_range(&self, offset: u64, data: &[u8]) -> Result<()>;
}

/// Records every flushed range in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingPmem {
    flushed: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl RecordingPmem {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranges flushed so far, in order, as `(offset, len)`.
    pub fn flushed_ranges(&self) -> Vec<(u64, u64)> {
        self.flushed
            .lock()
            .iter()
            .map(|(offset, data)| (*offset, data.len() as u64))
            .collect()
    }

    /// Bytes captured by the flush that started at `offset`, most recent first.
    pub fn flushed_data(&self, offset: u64) -> Option<Vec<u8>> {
        self.flushed
            .lock()
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, data)| data.clone())
    }

    /// Number of flushes performed.
    pub fn flush_count(&self) -> usize {
        self.flushed.lock().len()
    }
}

impl PersistentMemory for RecordingPmem {
    fn flush_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.flushed.lock().push((offset, data.to_vec()));
        Ok(())
    }
}

/// Persists ranges into a backing file with `pwrite` + `fdatasync`.
#[derive(Debug)]
pub struct FilePmem {
    path: PathBuf,
    file: File,
}

impl FilePmem {
    /// Create (or truncate) the backing file and size it to `len` bytes.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        debug!(path = %path.display(), len, "backing file created");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentMemory for FilePmem {
    fn flush_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        self.file.sync_data()?;
        Ok(())
    }
}
