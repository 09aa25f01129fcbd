//! Object log for large values
//!
//! Values above the configured threshold are appended here when their
//! record is created; the record keeps only an (offset, length) reference.

use crate::device::StorageDevice;
use bytes::Bytes;
use hybridkv_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Append-only value heap on its own device
pub struct ObjectLog {
    device: Arc<dyn StorageDevice>,
    tail: AtomicU64,
}

impl ObjectLog {
    /// Open over a device, appending after any existing contents
    pub fn new(device: Arc<dyn StorageDevice>) -> Result<Self> {
        let tail = device.len()?;
        Ok(Self {
            device,
            tail: AtomicU64::new(tail),
        })
    }

    /// Append a value, returning its offset
    pub fn append(&self, value: &[u8]) -> Result<u64> {
        let offset = self.tail.fetch_add(value.len() as u64, Ordering::SeqCst);
        self.device.write_at(offset, value)?;
        Ok(offset)
    }

    /// Read a value back
    pub fn read(&self, offset: u64, len: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; len as usize];
        let n = self.device.read_at(offset, &mut buf)?;
        if n < buf.len() {
            return Err(Error::device(format!(
                "object log {} truncated: wanted {} bytes at {}, got {}",
                self.device.name(),
                len,
                offset,
                n
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// Next append offset
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    /// Roll back to a recorded tail, discarding later values
    pub fn restore_tail(&self, tail: u64) -> Result<()> {
        self.device.truncate(tail)?;
        self.tail.store(tail, Ordering::SeqCst);
        Ok(())
    }

    /// Make appended values durable
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}
