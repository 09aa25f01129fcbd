//! HybridKV Storage Engine - Hybrid log key-value store
//!
//! This crate implements the engine:
//! - Epoch protection and cooperative phase transitions
//! - A lock-free, resizable hash index of key hashes to log addresses
//! - The hybrid log: mutable and read-only pages in memory, older pages on
//!   a storage device, large values in an object log
//! - Sessions with pending-operation completion
//! - Fold-over and snapshot checkpoints with concurrent prefix recovery
//!
//! ```no_run
//! use hybridkv_common::{CheckpointKind, StoreConfig};
//! use hybridkv_storage::{Status, Store, sum_functions};
//!
//! # fn main() -> hybridkv_common::Result<()> {
//! let store: Store<u64, u64> = Store::open(StoreConfig::with_data_dir("/tmp/hybridkv"))?;
//! let mut session = store.new_session(sum_functions::<u64>())?;
//! session.rmw(&2, 25)?;
//! assert_eq!(session.rmw(&2, 27)?, Status::Found(52));
//! store.checkpoint(CheckpointKind::Snapshot)?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod device;
pub mod epoch;
pub mod functions;
pub mod hlog;
pub mod index;
pub mod io;
pub mod read_cache;
pub mod session;
pub mod store;

// Re-exports
pub use checkpoint::{CheckpointMetadata, LatestPointer, SessionCommit};
pub use device::{FileDevice, MemoryDevice, StorageDevice};
pub use epoch::{EPOCH_TABLE_SIZE, EpochGuard, LightEpoch, Phase, SystemState};
pub use functions::{Functions, SimpleFunctions, TryAddFunctions, sum_functions};
pub use hlog::{HybridLog, LogStats, RecordRead};
pub use index::{HashIndex, IndexEntry, IndexSnapshot, IndexStats};
pub use io::IoPool;
pub use read_cache::{ReadCache, ReadCacheStats};
pub use session::{CompletedOperation, OperationKind, Session, Status};
pub use store::{Store, StoreStats};
