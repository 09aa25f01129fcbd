//! Core type definitions for HybridKV
//!
//! This module defines the fundamental types shared by the engine crates:
//! log addresses, key hashes, checkpoint tokens and session identifiers.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of address bits stored in an index entry
pub const ADDRESS_BITS: u32 = 48;

/// Logical address of a record in the hybrid log
///
/// The high bits select the page and the low `page_bits` bits the offset
/// within it. Addresses increase monotonically with append order.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, From, Into,
)]
pub struct Address(u64);

impl Address {
    /// The null back-pointer
    pub const INVALID: Self = Self(0);

    /// First address handed out by an empty log
    pub const FIRST_VALID: Self = Self(64);

    /// Largest representable address
    pub const MAX: Self = Self((1 << ADDRESS_BITS) - 1);

    /// Wrap a raw address
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an address from page number and offset
    #[must_use]
    pub const fn from_parts(page: u64, offset: u64, page_bits: u32) -> Self {
        Self((page << page_bits) | offset)
    }

    /// Raw value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Page number for the given page size
    #[must_use]
    pub const fn page(self, page_bits: u32) -> u64 {
        self.0 >> page_bits
    }

    /// Offset within the page
    #[must_use]
    pub const fn offset(self, page_bits: u32) -> u64 {
        self.0 & ((1 << page_bits) - 1)
    }

    /// Start of the page containing this address
    #[must_use]
    pub const fn page_start(self, page_bits: u32) -> Self {
        Self(self.0 & !((1 << page_bits) - 1))
    }

    /// Whether this is the null address
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further along the log
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 64-bit hash of an encoded key
///
/// The index stores the full hash per slot; the top bits double as the
/// entry tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, From, Into)]
pub struct KeyHash(u64);

impl KeyHash {
    /// Number of tag bits kept in an index entry
    pub const TAG_BITS: u32 = 14;

    /// Hash encoded key bytes
    #[must_use]
    pub fn of(key_bytes: &[u8]) -> Self {
        let raw = xxhash_rust::xxh64::xxh64(key_bytes, 0);
        // Zero marks an unclaimed index slot
        Self(if raw == 0 { 1 } else { raw })
    }

    /// Wrap a raw hash value (never zero)
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(if raw == 0 { 1 } else { raw })
    }

    /// Raw hash value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Entry tag: the top `TAG_BITS` bits
    #[must_use]
    pub const fn tag(self) -> u16 {
        (self.0 >> (64 - Self::TAG_BITS)) as u16
    }

    /// Home slot in a table of `size` (power of two) slots
    #[must_use]
    pub const fn home(self, size: u64) -> u64 {
        self.0 & (size - 1)
    }
}

/// Checkpoint strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CheckpointKind {
    /// The flushed log itself is the checkpoint
    #[display("fold-over")]
    FoldOver,
    /// The in-memory tail is copied into a separate image
    #[display("snapshot")]
    Snapshot,
}

impl std::str::FromStr for CheckpointKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fold-over" | "foldover" | "fold_over" => Ok(Self::FoldOver),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(format!("unknown checkpoint kind: {other}")),
        }
    }
}

/// Identifies one persisted checkpoint generation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("{_0}")]
pub struct CheckpointToken(Uuid);

impl CheckpointToken {
    /// Generate a fresh token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil token, returned when a checkpoint request is rejected
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the nil token
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parse from the canonical hyphenated form
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for CheckpointToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckpointToken({})", self.0)
    }
}

/// Identifies a session across checkpoints
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("{_0}")]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}
