//! Log record format
//!
//! ```text
//! +----------+---------+-------+----------+---------+-----------+--------+-----+-------+
//! | Prev     | Version | Flags | Reserved | Key Len | Value Len | CRC32C | Key | Value |
//! | 8B       | 4B      | 1B    | 3B       | 4B      | 4B        | 4B     | var | var   |
//! +----------+---------+-------+----------+---------+-----------+--------+-----+-------+
//! ```
//!
//! Records are padded to 8 bytes. Versions start at 1, so an all-zero
//! header marks unused space at the end of a page. The CRC covers the
//! header (with the invalid bit cleared) and the payload.

use bytes::Bytes;
use hybridkv_common::{Address, Error, Result};

/// Size of the fixed record header in bytes
pub const RECORD_HEADER_SIZE: usize = 28;

/// Offset of the flags byte within the header
pub const FLAGS_OFFSET: usize = 12;

/// Size of an object-log value reference
pub const OBJECT_REF_SIZE: usize = 16;

/// Record flag bits
pub mod flags {
    /// The record deletes its key
    pub const TOMBSTONE: u8 = 0x01;
    /// The value area holds an object-log reference
    pub const OBJECT: u8 = 0x02;
    /// The record was discarded and must be skipped
    pub const INVALID: u8 = 0x04;
}

/// Total padded size of a record
#[must_use]
pub const fn record_size(key_len: usize, value_len: usize) -> usize {
    (RECORD_HEADER_SIZE + key_len + value_len + 7) & !7
}

/// Fixed-size record header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub prev: Address,
    pub version: u32,
    pub flags: u8,
    pub key_len: u32,
    pub value_len: u32,
    pub crc: u32,
}

impl RecordHeader {
    /// Parse a header; `None` for unused space
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        if version == 0 {
            return None;
        }
        Some(Self {
            prev: Address::new(u64::from_le_bytes(buf[0..8].try_into().ok()?)),
            version,
            flags: buf[FLAGS_OFFSET],
            key_len: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            value_len: u32::from_le_bytes(buf[20..24].try_into().ok()?),
            crc: u32::from_le_bytes(buf[24..28].try_into().ok()?),
        })
    }

    fn encode_into(&self, buf: &mut [u8], flags: u8, crc: u32) {
        buf[0..8].copy_from_slice(&self.prev.raw().to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[FLAGS_OFFSET] = flags;
        buf[13..16].fill(0);
        buf[16..20].copy_from_slice(&self.key_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.value_len.to_le_bytes());
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
    }

    /// Padded size of the whole record
    #[must_use]
    pub const fn size(&self) -> usize {
        record_size(self.key_len as usize, self.value_len as usize)
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.flags & flags::TOMBSTONE != 0
    }

    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        self.flags & flags::INVALID != 0
    }

    #[must_use]
    pub const fn is_object(&self) -> bool {
        self.flags & flags::OBJECT != 0
    }
}

fn checksum(header_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut masked = [0u8; RECORD_HEADER_SIZE - 4];
    masked.copy_from_slice(&header_bytes[..RECORD_HEADER_SIZE - 4]);
    masked[FLAGS_OFFSET] &= !flags::INVALID;
    crc32c::crc32c_append(crc32c::crc32c(&masked), payload)
}

/// Where a record's value lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordValue {
    Inline(Bytes),
    Object { offset: u64, len: u64 },
}

/// A decoded record
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub address: Address,
    pub header: RecordHeader,
    pub key: Bytes,
    pub value: RecordValue,
}

impl LogRecord {
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.header.is_tombstone()
    }

    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        self.header.is_invalid()
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.header.version
    }

    #[must_use]
    pub const fn prev(&self) -> Address {
        self.header.prev
    }
}

/// Serialize a record, padding to its full size
pub fn encode_record(
    prev: Address,
    version: u32,
    record_flags: u8,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let header = RecordHeader {
        prev,
        version,
        flags: record_flags,
        key_len: key.len() as u32,
        value_len: value.len() as u32,
        crc: 0,
    };
    let mut buf = vec![0u8; header.size()];
    header.encode_into(&mut buf, record_flags, 0);
    let payload_end = RECORD_HEADER_SIZE + key.len() + value.len();
    buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key.len()].copy_from_slice(key);
    buf[RECORD_HEADER_SIZE + key.len()..payload_end].copy_from_slice(value);
    let crc = checksum(&buf, &buf[RECORD_HEADER_SIZE..payload_end]);
    buf[24..28].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Encode an object-log reference as a value area
#[must_use]
pub fn encode_object_ref(offset: u64, len: u64) -> [u8; OBJECT_REF_SIZE] {
    let mut out = [0u8; OBJECT_REF_SIZE];
    out[..8].copy_from_slice(&offset.to_le_bytes());
    out[8..].copy_from_slice(&len.to_le_bytes());
    out
}

/// Decode a full record image
///
/// `buf` must start at the record. The CRC is verified when `verify` is set
/// (records read back from a device).
pub fn decode_record(address: Address, buf: &[u8], verify: bool) -> Result<LogRecord> {
    let header = RecordHeader::decode(buf)
        .ok_or_else(|| Error::Deserialization(format!("no record at {address}")))?;
    let key_end = RECORD_HEADER_SIZE + header.key_len as usize;
    let value_end = key_end + header.value_len as usize;
    if buf.len() < value_end {
        return Err(Error::Deserialization(format!(
            "record at {address} truncated: need {value_end} bytes, have {}",
            buf.len()
        )));
    }
    if verify && checksum(buf, &buf[RECORD_HEADER_SIZE..value_end]) != header.crc {
        return Err(Error::ChecksumMismatch {
            location: format!("log record {address}"),
        });
    }

    let key = Bytes::copy_from_slice(&buf[RECORD_HEADER_SIZE..key_end]);
    let value_bytes = &buf[key_end..value_end];
    let value = if header.is_object() {
        if value_bytes.len() != OBJECT_REF_SIZE {
            return Err(Error::Deserialization(format!(
                "bad object reference in record {address}"
            )));
        }
        RecordValue::Object {
            offset: u64::from_le_bytes(value_bytes[..8].try_into().map_err(|_| {
                Error::Deserialization("object offset".into())
            })?),
            len: u64::from_le_bytes(value_bytes[8..].try_into().map_err(|_| {
                Error::Deserialization("object length".into())
            })?),
        }
    } else {
        RecordValue::Inline(Bytes::copy_from_slice(value_bytes))
    };

    Ok(LogRecord {
        address,
        header,
        key,
        value,
    })
}
