//! Storage devices backing the hybrid log
//!
//! A device is a flat byte space addressed by offset. The main log maps log
//! addresses one-to-one onto device offsets; the object log is an
//! append-only value heap.

use hybridkv_common::{Error, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Positional block storage used by the log
pub trait StorageDevice: Send + Sync {
    /// Read into `buf` starting at `offset`
    ///
    /// Bytes past the end of the device read as zero. Returns the number of
    /// bytes that were actually backed by the device.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` at `offset`, growing the device if needed
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> Result<()>;

    /// Shrink (or grow) the device to `len` bytes
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current device length in bytes
    fn len(&self) -> Result<u64>;

    /// Whether the device holds no bytes
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Human-readable name used in log messages
    fn name(&self) -> &str;
}

/// File-backed device using positional I/O
pub struct FileDevice {
    file: File,
    path: String,
}

impl FileDevice {
    /// Open a device file, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::device(format!("failed to open {path_str}: {e}")))?;

        Ok(Self {
            file,
            path: path_str,
        })
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl StorageDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| Error::device(format!("read failed on {}: {e}", self.path)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(filled)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::device(format!("write failed on {}: {e}", self.path)))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::device(format!("sync failed on {}: {e}", self.path)))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|e| Error::device(format!("truncate failed on {}: {e}", self.path)))
    }

    fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| Error::device(format!("failed to stat {}: {e}", self.path)))?
            .len())
    }

    fn name(&self) -> &str {
        &self.path
    }
}

/// Volatile device kept in a growable buffer
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    name: String,
}

impl MemoryDevice {
    /// Create an empty in-memory device
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            name: name.into(),
        }
    }
}

impl StorageDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let available = (data.len() - start).min(buf.len());
        buf[..available].copy_from_slice(&data[start..start + available]);
        buf[available..].fill(0);
        Ok(available)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
