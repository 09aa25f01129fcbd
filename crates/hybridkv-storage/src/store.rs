//! Store handle
//!
//! A [`Store`] owns the epoch table, hash index, hybrid log and checkpoint
//! manager. It is cheap to clone; the engine shuts down (joining its I/O
//! threads) when the last handle and the last session are dropped.

use crate::checkpoint::{CheckpointManager, CheckpointMetadata, SessionCommit, recovery};
use crate::device::{FileDevice, MemoryDevice, StorageDevice};
use crate::epoch::{LightEpoch, SystemState};
use crate::functions::Functions;
use crate::hlog::{HybridLog, LogStats};
use crate::index::{HashIndex, IndexStats};
use crate::session::{Session, SessionShared};
use hybridkv_common::{
    Address, CheckpointKind, CheckpointToken, Error, Result, SessionId, StoreConfig,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

/// Engine state shared by every handle and session
pub struct StoreCore {
    pub(crate) config: StoreConfig,
    pub(crate) epoch: Arc<LightEpoch>,
    pub(crate) index: Arc<HashIndex>,
    pub(crate) hlog: Arc<HybridLog>,
    pub(crate) checkpoints: CheckpointManager,
    sessions: Mutex<HashMap<SessionId, Arc<SessionShared>>>,
    recovered_sessions: Mutex<HashMap<SessionId, SessionCommit>>,
    recovered_version: Mutex<Option<u32>>,
}

impl StoreCore {
    pub(crate) fn register_session(&self, id: SessionId, shared: Arc<SessionShared>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(Error::invalid_state(format!("session {id} is already open")));
        }
        sessions.insert(id, shared);
        Ok(())
    }

    pub(crate) fn unregister_session(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    /// Commit point of every known session for a checkpoint of `version`
    pub(crate) fn session_commits(&self, version: u32) -> HashMap<SessionId, SessionCommit> {
        // Recovered sessions that were never continued keep their old position
        let mut commits = self.recovered_sessions.lock().clone();
        for (id, shared) in self.sessions.lock().iter() {
            commits.insert(*id, shared.commit_for(version));
        }
        commits
    }

    /// Drive checkpoint phases forward if one is running
    pub(crate) fn step_checkpoint(&self) {
        self.checkpoints.step(self);
    }

    fn recover(&self, token: Option<CheckpointToken>) -> Result<u32> {
        if !self.sessions.lock().is_empty() {
            return Err(Error::invalid_state("recovery requires all sessions to be closed"));
        }
        let state = self.epoch.system_state();
        if self.checkpoints.is_active() || state.phase != crate::epoch::Phase::Rest {
            return Err(Error::invalid_state(format!(
                "cannot recover while a checkpoint is running ({state})"
            )));
        }

        let metadata = self.checkpoints.resolve(token)?;
        let dir = self.checkpoints.dir()?;
        recovery::recover(self, dir, &metadata)?;

        *self.recovered_sessions.lock() = metadata.sessions.clone();
        *self.recovered_version.lock() = Some(metadata.version);
        info!(
            "Recovered checkpoint {} at version {} ({} sessions), store now at {}",
            metadata.token,
            metadata.version,
            metadata.sessions.len(),
            self.epoch.system_state()
        );
        Ok(metadata.version)
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub log: LogStats,
    pub index: IndexStats,
    pub phase: String,
    pub version: u32,
    pub active_sessions: usize,
    pub last_checkpoint_version: u32,
}

/// Handle to a key-value store with typed keys and values
///
/// Keys and values are encoded with bincode; two keys are equal when their
/// encodings are.
pub struct Store<K, V> {
    pub(crate) core: Arc<StoreCore>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _types: PhantomData,
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Serialize + DeserializeOwned + Clone + Send + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Open a store; logs live in `data_dir` or in memory
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let (log_device, object_device): (Arc<dyn StorageDevice>, Arc<dyn StorageDevice>) =
            match (config.log_path(), config.object_log_path()) {
                (Some(log), Some(objects)) => (
                    Arc::new(FileDevice::open(log)?),
                    Arc::new(FileDevice::open(objects)?),
                ),
                _ => (
                    Arc::new(MemoryDevice::new("hlog")),
                    Arc::new(MemoryDevice::new("hlog.obj")),
                ),
            };
        Self::open_with_devices(config, log_device, object_device)
    }

    /// Open a store over caller-supplied devices
    pub fn open_with_devices(
        config: StoreConfig,
        log_device: Arc<dyn StorageDevice>,
        object_device: Arc<dyn StorageDevice>,
    ) -> Result<Self> {
        config.validate()?;
        let epoch = Arc::new(LightEpoch::new(SystemState::INITIAL));
        let index = Arc::new(HashIndex::new(
            config.index.slot_count,
            config.index.grow_load_factor,
            Arc::clone(&epoch),
        ));
        let hlog = HybridLog::new(&config.log, Arc::clone(&epoch), log_device, object_device)?;
        let checkpoints = CheckpointManager::new(config.checkpoint.dir.clone());
        let try_recover = config.checkpoint.try_recover_latest;

        let core = Arc::new(StoreCore {
            config,
            epoch,
            index,
            hlog,
            checkpoints,
            sessions: Mutex::new(HashMap::new()),
            recovered_sessions: Mutex::new(HashMap::new()),
            recovered_version: Mutex::new(None),
        });

        if try_recover && core.checkpoints.has_latest()? {
            core.recover(None)?;
        }
        info!(
            "Store opened: {} index slots, {} byte pages",
            core.config.index.slot_count,
            core.hlog.page_size()
        );
        Ok(Self {
            core,
            _types: PhantomData,
        })
    }

    /// Open a new session with its merge callbacks
    pub fn new_session<F: Functions<V>>(&self, functions: F) -> Result<Session<K, V, F>> {
        Session::open(self.clone(), functions, SessionId::new(), 0)
    }

    /// Resume a session recorded in the recovered checkpoint
    ///
    /// Returns the session and the serial number up to which its
    /// operations were recovered.
    pub fn continue_session<F: Functions<V>>(
        &self,
        id: SessionId,
        functions: F,
    ) -> Result<(Session<K, V, F>, u64)> {
        let commit = self
            .core
            .recovered_sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_state(format!("session {id} is not part of the recovered checkpoint"))
            })?;
        let session = Session::open(self.clone(), functions, id, commit.until_serial)?;
        self.core.recovered_sessions.lock().remove(&id);
        info!(
            "Continued session {} at serial {}",
            id, commit.until_serial
        );
        Ok((session, commit.until_serial))
    }

    /// Request a checkpoint without blocking
    ///
    /// Returns `(false, nil token)` if another checkpoint is running.
    pub fn take_checkpoint(&self, kind: CheckpointKind) -> Result<(bool, CheckpointToken)> {
        self.core.checkpoints.take(&self.core, kind)
    }

    /// Drive a checkpoint from this thread until it persists or fails
    pub fn wait_checkpoint_complete(&self, token: CheckpointToken) -> Result<CheckpointMetadata> {
        self.core.checkpoints.wait(&self.core, token)
    }

    /// Take a checkpoint and wait for it
    pub fn checkpoint(&self, kind: CheckpointKind) -> Result<CheckpointMetadata> {
        let (accepted, token) = self.take_checkpoint(kind)?;
        if !accepted {
            return Err(Error::invalid_state("a checkpoint is already running"));
        }
        self.wait_checkpoint_complete(token)
    }

    /// Restore the store from `token`, or from the latest checkpoint
    ///
    /// Returns the recovered version.
    pub fn recover(&self, token: Option<CheckpointToken>) -> Result<u32> {
        self.core.recover(token)
    }

    /// Version of the checkpoint this store was recovered from
    pub fn recovered_version(&self) -> Option<u32> {
        *self.core.recovered_version.lock()
    }

    /// Sessions recorded in the recovered checkpoint and not yet continued
    pub fn recovered_sessions(&self) -> HashMap<SessionId, SessionCommit> {
        self.core.recovered_sessions.lock().clone()
    }

    /// Persisted checkpoints, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointMetadata>> {
        self.core.checkpoints.list()
    }

    /// Make the whole log read-only and flush it
    pub fn flush(&self, wait: bool) -> Result<Address> {
        let guard = self.core.epoch.guard()?;
        self.core.hlog.flush(wait, guard.slot())
    }

    /// Flush the whole log and evict it from memory
    pub fn flush_and_evict(&self, wait: bool) -> Result<()> {
        let guard = self.core.epoch.guard()?;
        self.core.hlog.flush_and_evict(wait, guard.slot())
    }

    /// Logically truncate the log; returns the new begin address
    pub fn shift_begin_address(&self, address: Address) -> Address {
        self.core.hlog.shift_begin_address(address)
    }

    /// Current system state
    pub fn system_state(&self) -> SystemState {
        self.core.epoch.system_state()
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.core.config
    }

    /// Block until a background index resize has finished
    pub fn wait_index_resize(&self) {
        self.core.index.wait_resize_idle();
    }

    /// Get statistics
    pub fn stats(&self) -> StoreStats {
        let state = self.core.epoch.system_state();
        StoreStats {
            log: self.core.hlog.stats(),
            index: self.core.index.stats(),
            phase: format!("{:?}", state.phase),
            version: state.version,
            active_sessions: self.core.sessions.lock().len(),
            last_checkpoint_version: self.core.checkpoints.completed_version(),
        }
    }
}
