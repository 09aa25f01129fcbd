//! Checksummed framing for persisted HybridKV files
//!
//! Checkpoint metadata and index snapshots are written as a single frame:
//!
//! ```text
//! +--------+---------+--------+--------+---------+
//! | Magic  | Version | Length | CRC32C | Payload |
//! | 4B     | 4B      | 8B     | 4B     | var     |
//! +--------+---------+--------+--------+---------+
//! ```

use crate::error::{Error, Result};

/// Size of the frame header in bytes
pub const FRAME_HEADER_SIZE: usize = 20;

/// Current frame format version
const FRAME_VERSION: u32 = 1;

/// A checksummed payload tagged with a file-type magic number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Wrap a payload
    pub fn new(magic: u32, payload: Vec<u8>) -> Self {
        Self { magic, payload }
    }

    /// Serialize header and payload
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&compute_crc32c(&self.payload).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse and verify a frame, expecting the given magic number
    pub fn from_bytes(data: &[u8], expected_magic: u32) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "frame too small: {} bytes",
                data.len()
            )));
        }

        let magic = u32::from_le_bytes(read_array(data, 0));
        if magic != expected_magic {
            return Err(Error::corrupted(format!(
                "bad magic {magic:#010x}, expected {expected_magic:#010x}"
            )));
        }

        let version = u32::from_le_bytes(read_array(data, 4));
        if version != FRAME_VERSION {
            return Err(Error::corrupted(format!("unsupported frame version {version}")));
        }

        let len = u64::from_le_bytes(read_array(data, 8)) as usize;
        let crc = u32::from_le_bytes(read_array(data, 16));
        let payload = data
            .get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)
            .ok_or_else(|| Error::corrupted("frame payload truncated"))?;

        if !verify_crc32c(payload, crc) {
            return Err(Error::corrupted("frame checksum mismatch"));
        }

        Ok(Self {
            magic,
            payload: payload.to_vec(),
        })
    }
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Continue a CRC32C over more data
#[inline]
#[must_use]
pub fn append_crc32c(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x4B56_5446;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(MAGIC, b"checkpoint payload".to_vec());
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 18);

        let parsed = Frame::from_bytes(&bytes, MAGIC).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_frame_detects_corruption() {
        let mut bytes = Frame::new(MAGIC, vec![7u8; 64]).to_bytes();
        bytes[FRAME_HEADER_SIZE + 10] ^= 0xFF;

        let err = Frame::from_bytes(&bytes, MAGIC).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_frame_wrong_magic_and_truncation() {
        let bytes = Frame::new(MAGIC, vec![1, 2, 3]).to_bytes();
        assert!(Frame::from_bytes(&bytes, MAGIC + 1).is_err());
        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1], MAGIC).is_err());
        assert!(Frame::from_bytes(&bytes[..4], MAGIC).is_err());
    }

    #[test]
    fn test_crc_append_matches_oneshot() {
        let whole = compute_crc32c(b"hello, world!");
        let split = append_crc32c(compute_crc32c(b"hello, "), b"world!");
        assert_eq!(whole, split);
        assert!(verify_crc32c(b"hello, world!", whole));
    }
}
