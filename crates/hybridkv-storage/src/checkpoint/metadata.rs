//! Checkpoint files
//!
//! ```text
//! <checkpoint dir>/
//!   latest                 JSON pointer to the newest complete checkpoint
//!   <token>/metadata.bin   framed bincode CheckpointMetadata
//!   <token>/index.bin      framed bincode IndexSnapshot
//!   <token>/snapshot.log   raw log image (snapshot checkpoints only)
//! ```
//!
//! A checkpoint directory is assembled under `<token>.tmp/` and renamed into
//! place once every file is synced; `latest` is replaced the same way.

use crate::index::IndexSnapshot;
use hybridkv_common::{
    Address, CheckpointKind, CheckpointToken, Error, Frame, Result, SessionId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metadata file name
pub const METADATA_FILE: &str = "metadata.bin";
/// Index snapshot file name
pub const INDEX_FILE: &str = "index.bin";
/// Snapshot log image file name
pub const SNAPSHOT_FILE: &str = "snapshot.log";
/// Latest checkpoint pointer file name
pub const LATEST_FILE: &str = "latest";

const METADATA_MAGIC: u32 = 0x484B_434D; // "HKCM"
const INDEX_MAGIC: u32 = 0x484B_4958; // "HKIX"

/// A session's position in a checkpoint's cut
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCommit {
    /// Every operation with a serial up to this one is included...
    pub until_serial: u64,
    /// ...except these, which were still pending at the cut
    pub excluded_serials: Vec<u64>,
}

/// Everything needed to recover a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub token: CheckpointToken,
    pub kind: CheckpointKind,
    /// Records with this version or older belong to the checkpoint
    pub version: u32,
    pub begin_address: Address,
    /// Tail when the checkpoint began
    pub start_address: Address,
    /// Tail at the cut; nothing at or beyond it is recovered
    pub final_address: Address,
    /// Start of `snapshot.log` in the log's address space
    pub snapshot_start: Option<Address>,
    pub object_log_tail: u64,
    pub index_file: String,
    pub sessions: HashMap<SessionId, SessionCommit>,
    /// Seconds since the Unix epoch
    pub created_at: u64,
}

/// Contents of the `latest` pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub token: CheckpointToken,
    pub version: u32,
}

/// Directory of a completed checkpoint
pub fn checkpoint_path(dir: &Path, token: CheckpointToken) -> PathBuf {
    dir.join(token.to_string())
}

/// Directory a checkpoint is assembled in
pub fn staging_path(dir: &Path, token: CheckpointToken) -> PathBuf {
    dir.join(format!("{token}.tmp"))
}

/// Write `data` to `path` and sync it
pub fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::device(format!("failed to create {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(data)
        .map_err(|e| Error::device(format!("failed to write {}: {e}", path.display())))?;
    writer
        .flush()
        .map_err(|e| Error::device(format!("failed to flush {}: {e}", path.display())))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| Error::device(format!("failed to sync {}: {e}", path.display())))?;
    Ok(())
}

fn sync_dir(dir: &Path) {
    // Directory fsync is best effort; not every platform allows it
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            debug!("Directory sync of {} skipped: {}", dir.display(), e);
        }
    }
}

fn encode<T: Serialize>(magic: u32, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(Frame::new(magic, payload).to_bytes())
}

fn read_file(path: &Path, token: CheckpointToken) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::CheckpointNotFound(token)
        } else {
            Error::device(format!("failed to read {}: {e}", path.display()))
        }
    })
}

impl CheckpointMetadata {
    /// Write metadata into a checkpoint directory
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_synced(&dir.join(METADATA_FILE), &encode(METADATA_MAGIC, self)?)
    }

    /// Load and validate the metadata of `token`
    pub fn load(checkpoint_dir: &Path, token: CheckpointToken) -> Result<Self> {
        let path = checkpoint_path(checkpoint_dir, token).join(METADATA_FILE);
        let bytes = read_file(&path, token)?;
        let frame = Frame::from_bytes(&bytes, METADATA_MAGIC)?;
        let metadata: Self = bincode::deserialize(&frame.payload)
            .map_err(|e| Error::corrupted(format!("{}: {e}", path.display())))?;

        if metadata.token != token {
            return Err(Error::corrupted(format!(
                "{} describes checkpoint {}, expected {}",
                path.display(),
                metadata.token,
                token
            )));
        }
        if metadata.begin_address > metadata.final_address
            || metadata.start_address > metadata.final_address
            || metadata
                .snapshot_start
                .is_some_and(|s| s > metadata.final_address)
        {
            return Err(Error::corrupted(format!(
                "{} has inconsistent addresses",
                path.display()
            )));
        }
        Ok(metadata)
    }

    /// Snapshot image path, if this is a snapshot checkpoint
    pub fn snapshot_path(&self, checkpoint_dir: &Path) -> Option<PathBuf> {
        self.snapshot_start
            .map(|_| checkpoint_path(checkpoint_dir, self.token).join(SNAPSHOT_FILE))
    }
}

/// Write an index snapshot into a checkpoint directory
pub fn write_index(dir: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    write_synced(&dir.join(INDEX_FILE), &encode(INDEX_MAGIC, snapshot)?)
}

/// Load the index snapshot of a checkpoint
pub fn load_index(
    checkpoint_dir: &Path,
    metadata: &CheckpointMetadata,
) -> Result<IndexSnapshot> {
    let path = checkpoint_path(checkpoint_dir, metadata.token).join(&metadata.index_file);
    let bytes = read_file(&path, metadata.token)?;
    let frame = Frame::from_bytes(&bytes, INDEX_MAGIC)?;
    bincode::deserialize(&frame.payload)
        .map_err(|e| Error::corrupted(format!("{}: {e}", path.display())))
}

/// Move a staged checkpoint into place
pub fn publish(checkpoint_dir: &Path, token: CheckpointToken) -> Result<PathBuf> {
    let staging = staging_path(checkpoint_dir, token);
    let target = checkpoint_path(checkpoint_dir, token);
    sync_dir(&staging);
    fs::rename(&staging, &target)
        .map_err(|e| Error::device(format!("failed to publish checkpoint {token}: {e}")))?;
    sync_dir(checkpoint_dir);
    Ok(target)
}

/// Atomically point `latest` at a checkpoint
pub fn write_latest(checkpoint_dir: &Path, pointer: LatestPointer) -> Result<()> {
    let data =
        serde_json::to_vec_pretty(&pointer).map_err(|e| Error::Serialization(e.to_string()))?;
    let temp = checkpoint_dir.join(format!("{LATEST_FILE}.tmp"));
    write_synced(&temp, &data)?;
    fs::rename(&temp, checkpoint_dir.join(LATEST_FILE))
        .map_err(|e| Error::device(format!("failed to update latest pointer: {e}")))?;
    sync_dir(checkpoint_dir);
    Ok(())
}

/// Read the `latest` pointer, if any
pub fn read_latest(checkpoint_dir: &Path) -> Result<Option<LatestPointer>> {
    let path = checkpoint_dir.join(LATEST_FILE);
    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::corrupted(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::device(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Remove a partially written checkpoint
pub fn discard_staging(checkpoint_dir: &Path, token: CheckpointToken) {
    let staging = staging_path(checkpoint_dir, token);
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            warn!("Failed to remove {}: {}", staging.display(), e);
        }
    }
}

/// Delete a published checkpoint
pub fn remove(checkpoint_dir: &Path, token: CheckpointToken) -> Result<()> {
    let path = checkpoint_path(checkpoint_dir, token);
    fs::remove_dir_all(&path)
        .map_err(|e| Error::device(format!("failed to remove {}: {e}", path.display())))?;
    sync_dir(checkpoint_dir);
    Ok(())
}

/// Every complete checkpoint in the directory, oldest first
pub fn list(checkpoint_dir: &Path) -> Result<Vec<CheckpointMetadata>> {
    if !checkpoint_dir.exists() {
        return Ok(Vec::new());
    }
    let mut found: Vec<CheckpointMetadata> = fs::read_dir(checkpoint_dir)
        .map_err(|e| Error::device(format!("failed to list checkpoints: {e}")))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| CheckpointToken::parse(&entry.file_name().to_string_lossy()).ok())
        .filter_map(|token| match CheckpointMetadata::load(checkpoint_dir, token) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!("Skipping unreadable checkpoint {}: {}", token, e);
                None
            }
        })
        .collect();
    found.sort_by_key(|m| (m.version, m.created_at));
    Ok(found)
}
