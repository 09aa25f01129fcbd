//! HybridKV Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration types, identifiers
//! and checksum helpers used by the HybridKV engine and tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Frame, FRAME_HEADER_SIZE};
pub use config::{CheckpointConfig, IndexConfig, LogConfig, StoreConfig};
pub use error::{Error, Result};
pub use types::*;
