//! Restoring a store from a persisted checkpoint

use super::metadata::{self, CheckpointMetadata};
use crate::epoch::SystemState;
use crate::index::{IndexEntry, IndexSnapshot};
use crate::store::StoreCore;
use hybridkv_common::{Error, KeyHash, Result};
use std::fs;
use std::path::Path;
use std::thread;
use tracing::{debug, info, warn};

/// Rebuild log, index and system state from `metadata`
///
/// No session may be open and no checkpoint may be running.
pub(crate) fn recover(core: &StoreCore, dir: &Path, metadata: &CheckpointMetadata) -> Result<()> {
    let hlog = &core.hlog;
    info!(
        "Recovering checkpoint {} ({}, version {}): begin {}, final {}",
        metadata.token,
        metadata.kind,
        metadata.version,
        metadata.begin_address,
        metadata.final_address
    );

    // Everything is read and checked before the first write to the device,
    // so a damaged checkpoint leaves the running store untouched
    let image = load_snapshot_image(dir, metadata)?;
    let snapshot = metadata::load_index(dir, metadata)?;

    // Let deferred flushes of the current log run before the device is rewritten
    while core.epoch.pending_actions() > 0 {
        core.epoch.bump_current_epoch();
        thread::yield_now();
    }
    hlog.drain_io();
    check_log_intact(core, metadata)?;

    // Appends after this recovery reuse the log range of any later checkpoint
    let retired = core.checkpoints.retire_newer(metadata)?;
    if retired > 0 {
        info!(
            "Retired {} checkpoints newer than version {}",
            retired, metadata.version
        );
    }

    if let (Some(start), Some(image)) = (metadata.snapshot_start, image) {
        hlog.write_image(start, &image)?;
        debug!("Wrote {} byte snapshot image at {}", image.len(), start);
    }
    hlog.truncate_device(metadata.final_address)?;

    let invalidated =
        hlog.invalidate_newer(metadata.start_address, metadata.final_address, metadata.version)?;
    if invalidated > 0 {
        debug!(
            "Invalidated {} records newer than version {}",
            invalidated, metadata.version
        );
    }
    hlog.restore_object_log(metadata.object_log_tail)?;

    let rolled = roll_back_index(core, metadata, snapshot)?;
    core.index.restore(&rolled)?;

    hlog.reset_to(metadata.begin_address, metadata.final_address)?;
    core.epoch
        .reset_state(SystemState::rest(metadata.version + 1));
    Ok(())
}

/// Read a snapshot checkpoint's image and check it covers its range
fn load_snapshot_image(dir: &Path, metadata: &CheckpointMetadata) -> Result<Option<Vec<u8>>> {
    let (Some(start), Some(path)) = (metadata.snapshot_start, metadata.snapshot_path(dir)) else {
        return Ok(None);
    };
    let image = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::corrupted(format!("snapshot image {} is missing", path.display()))
        } else {
            Error::device(format!("failed to read {}: {e}", path.display()))
        }
    })?;
    let expected = metadata.final_address.raw() - start.raw();
    if image.len() as u64 != expected {
        return Err(Error::corrupted(format!(
            "snapshot image {} holds {} bytes, expected {}",
            path.display(),
            image.len(),
            expected
        )));
    }
    Ok(Some(image))
}

/// The part of the checkpoint that lives only in the log device must still be there
fn check_log_intact(core: &StoreCore, metadata: &CheckpointMetadata) -> Result<()> {
    let needed = metadata.snapshot_start.unwrap_or(metadata.final_address);
    if needed <= metadata.begin_address {
        return Ok(());
    }
    let held = core.hlog.device_len()?;
    if held < needed.raw() {
        return Err(Error::corrupted(format!(
            "checkpoint {} needs the log device up to {}, it holds {:#x} bytes",
            metadata.token, needed, held
        )));
    }
    Ok(())
}

/// Point every entry at its newest record that survived recovery
fn roll_back_index(
    core: &StoreCore,
    metadata: &CheckpointMetadata,
    snapshot: IndexSnapshot,
) -> Result<IndexSnapshot> {
    let mut entries = Vec::with_capacity(snapshot.entries.len());
    let mut rolled_back = 0u64;
    let mut dropped = 0u64;

    for (hash, entry) in snapshot.entries {
        // Records before the checkpoint began are never newer than its version
        if entry.address() < metadata.start_address {
            if entry.address() >= metadata.begin_address {
                entries.push((hash, entry));
            } else {
                dropped += 1;
            }
            continue;
        }

        let tag = KeyHash::from_raw(hash).tag();
        let mut address = entry.address();
        let restored = loop {
            if address.is_invalid() || address < metadata.begin_address {
                break None;
            }
            if address >= metadata.final_address {
                warn!(
                    "Index entry {:#x} points past the checkpoint at {}",
                    hash, address
                );
                break None;
            }
            match core.hlog.read_header_from_device(address)? {
                Some(header) if header.is_invalid() || header.version > metadata.version => {
                    address = header.prev;
                }
                Some(header) => break Some(IndexEntry::new(address, tag, header.is_tombstone())),
                None => break None,
            }
        };

        match restored {
            Some(restored) => {
                if restored.address() != entry.address() {
                    rolled_back += 1;
                }
                entries.push((hash, restored));
            }
            None => dropped += 1,
        }
    }

    if rolled_back + dropped > 0 {
        debug!(
            "Index rollback: {} entries moved back, {} dropped",
            rolled_back, dropped
        );
    }
    Ok(IndexSnapshot {
        size: snapshot.size,
        entries,
    })
}
