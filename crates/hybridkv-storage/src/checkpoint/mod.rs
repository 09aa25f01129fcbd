//! Fuzzy checkpoints driven through the epoch phase protocol
//!
//! ```text
//! Rest(v) -> Prepare(v) -> InProgress(v+1) -> WaitFlush(v+1)
//!         -> PersistenceCallback(v+1) -> Rest(v+1)
//! ```
//!
//! Sessions move to version `v+1` when they observe `InProgress`. Once every
//! protected session has done so, the index is captured and the log tail is
//! fixed as the checkpoint's final address; every record below it carries a
//! version of at most `v + 1`, and recovery invalidates the `v + 1` ones.
//!
//! Nothing here blocks a session. Any thread that notices a phase transition
//! calls [`CheckpointManager::step`], which advances the protocol as far as
//! the current state allows and returns.

pub mod metadata;
pub mod recovery;

use crate::epoch::{Phase, SystemState};
use crate::index::IndexSnapshot;
use crate::store::StoreCore;
use hybridkv_common::{Address, CheckpointKind, CheckpointToken, Error, Result};
pub use metadata::{CheckpointMetadata, LatestPointer, SessionCommit};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// The checkpoint currently moving through the phases
struct ActiveCheckpoint {
    token: CheckpointToken,
    kind: CheckpointKind,
    version: u32,
    begin_address: Address,
    start_address: Address,
    final_address: Address,
    snapshot_start: Option<Address>,
    object_log_tail: u64,
    index: Option<IndexSnapshot>,
    /// Set once no thread can still be writing below the final address
    barrier: Arc<AtomicBool>,
    started: Instant,
}

type Outcome = std::result::Result<CheckpointMetadata, String>;

/// Coordinates checkpoint attempts for one store
pub struct CheckpointManager {
    dir: Option<PathBuf>,
    driver: Mutex<()>,
    active: Mutex<Option<ActiveCheckpoint>>,
    outcomes: Mutex<HashMap<CheckpointToken, Outcome>>,
    last_completed: Mutex<Option<Arc<CheckpointMetadata>>>,
    completed_version: AtomicU32,
}

impl CheckpointManager {
    /// Manager writing into `dir`; without a directory every request fails
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            driver: Mutex::new(()),
            active: Mutex::new(None),
            outcomes: Mutex::new(HashMap::new()),
            last_completed: Mutex::new(None),
            completed_version: AtomicU32::new(0),
        }
    }

    /// Checkpoint directory
    pub fn dir(&self) -> Result<&Path> {
        self.dir
            .as_deref()
            .ok_or_else(|| Error::Configuration("checkpoint.dir is not set".into()))
    }

    /// Whether a checkpoint is running
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Version of the newest checkpoint persisted by this store (0 if none)
    pub fn completed_version(&self) -> u32 {
        self.completed_version.load(Ordering::Acquire)
    }

    /// Metadata of the newest checkpoint persisted by this store
    pub fn last_completed(&self) -> Option<Arc<CheckpointMetadata>> {
        self.last_completed.lock().clone()
    }

    /// Start a checkpoint unless one is already running
    ///
    /// Returns `(false, nil)` when the store is not at rest.
    pub(crate) fn take(
        &self,
        core: &StoreCore,
        kind: CheckpointKind,
    ) -> Result<(bool, CheckpointToken)> {
        self.dir()?;
        let mut active = self.active.lock();
        let state = core.epoch.system_state();
        if active.is_some() || state.phase != Phase::Rest {
            debug!("Checkpoint request rejected in state {}", state);
            return Ok((false, CheckpointToken::nil()));
        }
        if !core
            .epoch
            .try_advance(state, SystemState::new(Phase::Prepare, state.version))
        {
            return Ok((false, CheckpointToken::nil()));
        }

        let token = CheckpointToken::new();
        *active = Some(ActiveCheckpoint {
            token,
            kind,
            version: state.version,
            begin_address: core.hlog.begin_address(),
            start_address: core.hlog.tail_address(),
            final_address: Address::INVALID,
            snapshot_start: None,
            object_log_tail: 0,
            index: None,
            barrier: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        });
        info!(
            "Checkpoint {} ({}) started at version {}",
            token, kind, state.version
        );
        Ok((true, token))
    }

    /// Drive `token` to completion from the calling thread
    pub(crate) fn wait(&self, core: &StoreCore, token: CheckpointToken) -> Result<CheckpointMetadata> {
        loop {
            if let Some(outcome) = self.outcomes.lock().get(&token) {
                return outcome.clone().map_err(|reason| Error::CheckpointFailed { token, reason });
            }
            let running = self.active.lock().as_ref().map(|cp| cp.token);
            if running != Some(token) {
                // Finished between the two checks
                if let Some(outcome) = self.outcomes.lock().get(&token) {
                    return outcome
                        .clone()
                        .map_err(|reason| Error::CheckpointFailed { token, reason });
                }
                return Err(Error::CheckpointNotFound(token));
            }

            {
                let guard = core.epoch.guard()?;
                core.epoch.refresh_phase(guard.slot(), |_| {});
                self.step(core);
                guard.refresh();
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    /// Advance the running checkpoint if every session has caught up
    pub(crate) fn step(&self, core: &StoreCore) {
        let Some(_driver) = self.driver.try_lock() else {
            return;
        };
        let state = core.epoch.system_state();
        if state.phase == Phase::Rest || !core.epoch.is_phase_complete(state) {
            return;
        }
        let mut active = self.active.lock();
        let Some(cp) = active.as_mut() else {
            return;
        };

        match state.phase {
            Phase::Prepare => {
                let next = SystemState::new(Phase::InProgress, state.version + 1);
                if core.epoch.try_advance(state, next) {
                    debug!("Checkpoint {}: {} -> {}", cp.token, state, next);
                }
            }
            Phase::InProgress => {
                // Taken before the final address so every entry points below it
                let Some(index) = core.index.try_snapshot() else {
                    debug!("Checkpoint {}: index resizing, retrying", cp.token);
                    return;
                };
                cp.index = Some(index);
                cp.final_address = core.hlog.tail_address();
                cp.object_log_tail = core.hlog.object_log_tail();
                cp.begin_address = core.hlog.begin_address();
                match cp.kind {
                    CheckpointKind::FoldOver => {
                        core.hlog.shift_read_only_address(cp.final_address);
                        cp.barrier.store(true, Ordering::SeqCst);
                    }
                    CheckpointKind::Snapshot => {
                        cp.snapshot_start =
                            Some(core.hlog.flushed_until_address().min(cp.final_address));
                        let barrier = Arc::clone(&cp.barrier);
                        core.epoch
                            .bump_with_action(move || barrier.store(true, Ordering::SeqCst));
                    }
                }
                let next = SystemState::new(Phase::WaitFlush, state.version);
                if core.epoch.try_advance(state, next) {
                    debug!(
                        "Checkpoint {}: final address {}, {} index entries",
                        cp.token,
                        cp.final_address,
                        cp.index.as_ref().map_or(0, |i| i.entries.len())
                    );
                }
            }
            Phase::WaitFlush => {
                if let Err(e) = core.hlog.check_flush_error() {
                    self.abort(core, &mut active, state, e.to_string());
                    return;
                }
                let ready = cp.barrier.load(Ordering::SeqCst)
                    && match cp.kind {
                        CheckpointKind::FoldOver => {
                            core.hlog.flushed_until_address() >= cp.final_address
                        }
                        CheckpointKind::Snapshot => true,
                    };
                if !ready {
                    return;
                }
                match self.persist(core, cp) {
                    Ok(metadata) => {
                        info!(
                            "Checkpoint {} ({}) persisted: version {}, final address {}, {} sessions, {:?}",
                            metadata.token,
                            metadata.kind,
                            metadata.version,
                            metadata.final_address,
                            metadata.sessions.len(),
                            cp.started.elapsed()
                        );
                        self.completed_version
                            .store(metadata.version, Ordering::Release);
                        *self.last_completed.lock() = Some(Arc::new(metadata.clone()));
                        self.outcomes.lock().insert(metadata.token, Ok(metadata));
                        core.epoch.try_advance(
                            state,
                            SystemState::new(Phase::PersistenceCallback, state.version),
                        );
                    }
                    Err(e) => self.abort(core, &mut active, state, e.to_string()),
                }
            }
            Phase::PersistenceCallback => {
                let token = cp.token;
                *active = None;
                core.epoch.try_advance(state, SystemState::rest(state.version));
                debug!("Checkpoint {} complete, store at rest", token);
            }
            Phase::Rest => {}
        }
    }

    fn abort(
        &self,
        core: &StoreCore,
        active: &mut Option<ActiveCheckpoint>,
        state: SystemState,
        reason: String,
    ) {
        let Some(cp) = active.take() else {
            return;
        };
        warn!("Checkpoint {} aborted: {}", cp.token, reason);
        if let Some(dir) = &self.dir {
            metadata::discard_staging(dir, cp.token);
        }
        self.outcomes.lock().insert(cp.token, Err(reason));
        core.epoch
            .try_advance(state, SystemState::rest(state.version));
    }

    fn persist(&self, core: &StoreCore, cp: &ActiveCheckpoint) -> Result<CheckpointMetadata> {
        let dir = self.dir()?;
        let checkpoint_failed = |reason: String| Error::CheckpointFailed {
            token: cp.token,
            reason,
        };

        core.hlog.sync_devices()?;
        let staging = metadata::staging_path(dir, cp.token);
        fs::create_dir_all(&staging).map_err(|e| {
            checkpoint_failed(format!("failed to create {}: {e}", staging.display()))
        })?;

        if let Some(start) = cp.snapshot_start {
            let image = core.hlog.copy_range(start, cp.final_address)?;
            metadata::write_synced(&staging.join(metadata::SNAPSHOT_FILE), &image)?;
        }
        let index = cp
            .index
            .as_ref()
            .ok_or_else(|| checkpoint_failed("index snapshot missing".into()))?;
        metadata::write_index(&staging, index)?;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let metadata = CheckpointMetadata {
            token: cp.token,
            kind: cp.kind,
            version: cp.version,
            begin_address: cp.begin_address,
            start_address: cp.start_address.min(cp.final_address),
            final_address: cp.final_address,
            snapshot_start: cp.snapshot_start,
            object_log_tail: cp.object_log_tail,
            index_file: metadata::INDEX_FILE.to_string(),
            sessions: core.session_commits(cp.version),
            created_at,
        };
        metadata.write(&staging)?;

        metadata::publish(dir, cp.token)?;
        metadata::write_latest(
            dir,
            LatestPointer {
                token: cp.token,
                version: cp.version,
            },
        )?;
        Ok(metadata)
    }

    /// Every persisted checkpoint, oldest first
    pub fn list(&self) -> Result<Vec<CheckpointMetadata>> {
        metadata::list(self.dir()?)
    }

    /// Resolve a token, defaulting to the `latest` pointer
    pub fn resolve(&self, token: Option<CheckpointToken>) -> Result<CheckpointMetadata> {
        let dir = self.dir()?;
        let token = match token {
            Some(token) => token,
            None => metadata::read_latest(dir)?
                .ok_or(Error::NoCheckpoint)?
                .token,
        };
        CheckpointMetadata::load(dir, token)
    }

    /// Make `metadata` the newest checkpoint before recovering it
    ///
    /// Points `latest` at it and deletes every checkpoint of a later
    /// version, whose log range the recovered store is about to overwrite.
    /// Returns how many were deleted.
    pub(crate) fn retire_newer(&self, metadata: &CheckpointMetadata) -> Result<usize> {
        let dir = self.dir()?;
        let latest = metadata::read_latest(dir).ok().flatten();
        if latest.map(|p| p.token) != Some(metadata.token) {
            metadata::write_latest(
                dir,
                LatestPointer {
                    token: metadata.token,
                    version: metadata.version,
                },
            )?;
        }

        let mut retired = 0;
        for newer in metadata::list(dir)?
            .into_iter()
            .filter(|m| m.version > metadata.version)
        {
            warn!(
                "Deleting checkpoint {} (version {}) superseded by recovery of version {}",
                newer.token, newer.version, metadata.version
            );
            metadata::remove(dir, newer.token)?;
            retired += 1;
        }

        self.completed_version
            .store(metadata.version, Ordering::Release);
        *self.last_completed.lock() = Some(Arc::new(metadata.clone()));
        Ok(retired)
    }

    /// Whether a `latest` pointer exists
    pub fn has_latest(&self) -> Result<bool> {
        match &self.dir {
            Some(dir) => Ok(metadata::read_latest(dir)?.is_some()),
            None => Ok(false),
        }
    }
}
