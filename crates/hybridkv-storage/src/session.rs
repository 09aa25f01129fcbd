//! Sessions: one logical caller bound to the store
//!
//! Every operation runs inside the session's epoch slot:
//!
//! 1. protect the slot and acknowledge any new system state, switching to
//!    the next version when a checkpoint has moved on;
//! 2. take the next serial number;
//! 3. resolve the key through the index and the log;
//! 4. unprotect.
//!
//! Reads and read-modify-writes that reach a record on disk return
//! [`Status::Pending`]. The device read runs on the I/O pool and its
//! completion lands on the session's channel; [`Session::complete_pending`]
//! (or the async variants) resumes the operation in the session's context.
//!
//! When a session moves from version `v` to `v + 1` it records a commit
//! point: every serial up to the current one, minus the operations still
//! pending, belongs to the checkpoint of version `v`.

use crate::checkpoint::SessionCommit;
use crate::epoch::Phase;
use crate::functions::Functions;
use crate::hlog::RecordRead;
use crate::hlog::record::LogRecord;
use crate::store::{Store, StoreCore};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use hybridkv_common::{Address, Error, KeyHash, Result, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Result of a session operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status<V> {
    /// The key has a value (for RMW: the value after the operation)
    Found(V),
    /// The key has no value (for RMW: the initial value was written)
    NotFound,
    /// Waiting on a device read; resolved through `complete_pending`
    Pending(u64),
}

impl<V> Status<V> {
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// The value, if found
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Operations that can go pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Rmw,
}

/// A pending operation that has finished
#[derive(Debug)]
pub struct CompletedOperation<K, V> {
    /// Serial number the operation was issued with
    pub serial: u64,
    pub key: K,
    pub kind: OperationKind,
    /// `Found` or `NotFound`, or the error that ended the operation
    pub result: Result<Status<V>>,
}

struct SharedState {
    version: u32,
    serial: u64,
    pending: BTreeSet<u64>,
    /// Commit point recorded when switching to the given version
    cut: Option<(u32, SessionCommit)>,
}

/// The part of a session the checkpoint driver reads
pub struct SessionShared {
    state: Mutex<SharedState>,
}

impl SessionShared {
    fn new(version: u32, serial: u64) -> Self {
        Self {
            state: Mutex::new(SharedState {
                version,
                serial,
                pending: BTreeSet::new(),
                cut: None,
            }),
        }
    }

    /// This session's commit point for a checkpoint of `version`
    pub(crate) fn commit_for(&self, version: u32) -> SessionCommit {
        let state = self.state.lock();
        match &state.cut {
            Some((cut_version, commit))
                if *cut_version == version + 1 && state.version == *cut_version =>
            {
                commit.clone()
            }
            _ => SessionCommit {
                until_serial: state.serial,
                excluded_serials: state.pending.iter().copied().collect(),
            },
        }
    }
}

struct IoCompletion {
    serial: u64,
    result: Result<LogRecord>,
}

enum PendingKind<I> {
    Read,
    Rmw {
        input: I,
        /// Index entry address the operation saw before going to disk
        expected: Address,
    },
}

struct PendingOperation<K, I> {
    key: K,
    key_bytes: Bytes,
    hash: KeyHash,
    kind: PendingKind<I>,
}

/// Value fetched for an RMW, valid while the index still points at `expected`
struct Known<V> {
    expected: Address,
    value: Option<V>,
}

enum Trace {
    Found(LogRecord),
    Absent,
    OnDisk(Address),
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// A single-caller handle for reads and writes
///
/// Methods take `&mut self`; share the [`Store`] and open one session per
/// thread or task instead of sharing a session.
pub struct Session<K, V, F: Functions<V>> {
    store: Store<K, V>,
    functions: F,
    id: SessionId,
    slot: usize,
    version: u32,
    shared: Arc<SessionShared>,
    pending: HashMap<u64, PendingOperation<K, F::Input>>,
    io_tx: Sender<IoCompletion>,
    io_rx: Receiver<IoCompletion>,
    inbox: VecDeque<IoCompletion>,
    ready: VecDeque<CompletedOperation<K, V>>,
    notify: Arc<Notify>,
    notified_version: u32,
}

impl<K, V, F> Session<K, V, F>
where
    K: Serialize + DeserializeOwned + Clone + Send + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + 'static,
    F: Functions<V>,
{
    pub(crate) fn open(store: Store<K, V>, functions: F, id: SessionId, serial: u64) -> Result<Self> {
        let core = Arc::clone(&store.core);
        let slot = core.epoch.acquire_slot()?;
        let version = core.epoch.system_state().version;
        let shared = Arc::new(SessionShared::new(version, serial));
        if let Err(e) = core.register_session(id, Arc::clone(&shared)) {
            core.epoch.release_slot(slot);
            return Err(e);
        }
        let (io_tx, io_rx) = unbounded();
        debug!("Session {} opened at version {} (slot {})", id, version, slot);

        Ok(Self {
            store,
            functions,
            id,
            slot,
            version,
            shared,
            pending: HashMap::new(),
            io_tx,
            io_rx,
            inbox: VecDeque::new(),
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            notified_version: core.checkpoints.completed_version(),
        })
    }

    /// Session identifier, stable across checkpoints
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Version this session is operating in
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Serial number of the last issued operation
    pub fn serial(&self) -> u64 {
        self.shared.state.lock().serial
    }

    /// Number of operations waiting on I/O
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The session's merge callbacks
    pub const fn functions(&self) -> &F {
        &self.functions
    }

    /// Read the value of `key`
    pub fn read(&mut self, key: &K) -> Result<Status<V>> {
        let key_bytes = encode(key)?;
        let hash = KeyHash::of(&key_bytes);
        let core = Arc::clone(&self.store.core);
        self.enter(&core);
        let serial = self.next_serial();
        let result = self.read_internal(&core, serial, key, key_bytes, hash);
        core.epoch.unprotect(self.slot);
        result
    }

    /// Set the value of `key`
    pub fn upsert(&mut self, key: &K, value: &V) -> Result<()> {
        let key_bytes = encode(key)?;
        let value_bytes = encode(value)?;
        let hash = KeyHash::of(&key_bytes);
        let core = Arc::clone(&self.store.core);
        self.enter(&core);
        let serial = self.next_serial();
        let result = self.append_blind(&core, serial, &key_bytes, &value_bytes, hash, false);
        core.epoch.unprotect(self.slot);
        result
    }

    /// Merge `input` into the value of `key`
    pub fn rmw(&mut self, key: &K, input: F::Input) -> Result<Status<V>> {
        let key_bytes = encode(key)?;
        let hash = KeyHash::of(&key_bytes);
        let core = Arc::clone(&self.store.core);
        self.enter(&core);
        let serial = self.next_serial();
        let result = self.rmw_internal(&core, serial, key, key_bytes, hash, input, None);
        core.epoch.unprotect(self.slot);
        result
    }

    /// Delete `key`
    pub fn delete(&mut self, key: &K) -> Result<()> {
        let key_bytes = encode(key)?;
        let hash = KeyHash::of(&key_bytes);
        let core = Arc::clone(&self.store.core);
        self.enter(&core);
        let serial = self.next_serial();
        let result = if core.index.find_slot(hash).is_some() {
            self.append_blind(&core, serial, &key_bytes, &[], hash, true)
        } else {
            Ok(())
        };
        core.epoch.unprotect(self.slot);
        result
    }

    /// Resume operations whose I/O has finished
    ///
    /// With `wait`, blocks until no operation is pending. Returns every
    /// operation that finished since the last call.
    pub fn complete_pending(&mut self, wait: bool) -> Result<Vec<CompletedOperation<K, V>>> {
        let core = Arc::clone(&self.store.core);
        loop {
            self.enter(&core);
            self.drain_completions(&core);
            core.epoch.unprotect(self.slot);

            if !wait || self.pending.is_empty() {
                break;
            }
            match self.io_rx.recv_timeout(Duration::from_millis(1)) {
                Ok(completion) => self.inbox.push_back(completion),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(Error::internal("session completion channel closed"));
                }
            }
        }
        Ok(self.ready.drain(..).collect())
    }

    /// Read `key`, awaiting the device if needed
    pub async fn read_async(&mut self, key: &K) -> Result<Status<V>> {
        match self.read(key)? {
            Status::Pending(serial) => self.wait_for(serial).await,
            done => Ok(done),
        }
    }

    /// Merge `input` into `key`, awaiting the device if needed
    pub async fn rmw_async(&mut self, key: &K, input: F::Input) -> Result<Status<V>> {
        match self.rmw(key, input)? {
            Status::Pending(serial) => self.wait_for(serial).await,
            done => Ok(done),
        }
    }

    /// Await one pending operation; other completions wait for the next
    /// `complete_pending`
    async fn wait_for(&mut self, serial: u64) -> Result<Status<V>> {
        let core = Arc::clone(&self.store.core);
        let notify = Arc::clone(&self.notify);
        loop {
            let notified = notify.notified();
            self.enter(&core);
            self.drain_completions(&core);
            core.epoch.unprotect(self.slot);

            if let Some(position) = self.ready.iter().position(|op| op.serial == serial) {
                if let Some(done) = self.ready.remove(position) {
                    return done.result;
                }
            }
            if !self.pending.contains_key(&serial) {
                return Err(Error::internal(format!("operation {serial} is not pending")));
            }
            notified.await;
        }
    }

    fn enter(&mut self, core: &StoreCore) {
        core.epoch.protect(self.slot);
        self.refresh_phase(core, None);
    }

    /// Acknowledge the system state; `in_flight` is excluded from the
    /// commit point if the version changes
    fn refresh_phase(&mut self, core: &StoreCore, in_flight: Option<u64>) -> bool {
        let mut observed = None;
        let state = core
            .epoch
            .refresh_phase(self.slot, |state| observed = Some(state));

        let mut switched = false;
        if let Some(observed) = observed {
            if observed.version > self.version {
                self.switch_version(observed.version, in_flight);
                switched = true;
            }
        }
        if state.phase != Phase::Rest {
            core.step_checkpoint();
        }
        self.notify_checkpoint(core);
        switched
    }

    fn switch_version(&mut self, version: u32, in_flight: Option<u64>) {
        let mut state = self.shared.state.lock();
        let mut excluded: Vec<u64> = state.pending.iter().copied().collect();
        if let Some(serial) = in_flight {
            if !state.pending.contains(&serial) {
                excluded.push(serial);
                excluded.sort_unstable();
            }
        }
        let commit = SessionCommit {
            until_serial: state.serial,
            excluded_serials: excluded,
        };
        debug!(
            "Session {} moves to version {} at serial {} ({} excluded)",
            self.id,
            version,
            commit.until_serial,
            commit.excluded_serials.len()
        );
        state.cut = Some((version, commit));
        state.version = version;
        self.version = version;
    }

    /// Met a record of a newer version: move to that version before
    /// writing on top of it
    fn cpr_shift(&mut self, core: &StoreCore, serial: u64) -> bool {
        trace!("Session {} CPR shift at serial {}", self.id, serial);
        self.refresh_phase(core, Some(serial))
    }

    fn notify_checkpoint(&mut self, core: &StoreCore) {
        let completed = core.checkpoints.completed_version();
        if completed <= self.notified_version {
            return;
        }
        self.notified_version = completed;
        if let Some(metadata) = core.checkpoints.last_completed() {
            if let Some(commit) = metadata.sessions.get(&self.id) {
                self.functions
                    .checkpoint_completed(self.id, commit.until_serial);
            }
        }
    }

    fn next_serial(&mut self) -> u64 {
        let mut state = self.shared.state.lock();
        state.serial += 1;
        state.serial
    }

    /// Walk the chain from `address` to the newest record of the key
    fn trace(&self, core: &StoreCore, mut address: Address, key_bytes: &[u8]) -> Result<Trace> {
        loop {
            match core.hlog.read(address)? {
                RecordRead::BelowBegin => return Ok(Trace::Absent),
                RecordRead::OnDisk => return Ok(Trace::OnDisk(address)),
                RecordRead::Found(record) => {
                    if !record.is_invalid() && record.key.as_ref() == key_bytes {
                        return Ok(Trace::Found(record));
                    }
                    address = record.prev();
                }
            }
        }
    }

    fn decode_value(core: &StoreCore, record: &LogRecord) -> Result<V> {
        let bytes = core.hlog.load_value(record)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn record_status(core: &StoreCore, record: Option<&LogRecord>) -> Result<Status<V>> {
        match record {
            Some(record) if !record.is_tombstone() => {
                Ok(Status::Found(Self::decode_value(core, record)?))
            }
            _ => Ok(Status::NotFound),
        }
    }

    fn read_internal(
        &mut self,
        core: &StoreCore,
        serial: u64,
        key: &K,
        key_bytes: Bytes,
        hash: KeyHash,
    ) -> Result<Status<V>> {
        let Some(slot) = core.index.find_slot(hash) else {
            return Ok(Status::NotFound);
        };
        match self.trace(core, slot.entry().address(), &key_bytes)? {
            Trace::Found(record) => Self::record_status(core, Some(&record)),
            Trace::Absent => Ok(Status::NotFound),
            Trace::OnDisk(address) => {
                let op = PendingOperation {
                    key: key.clone(),
                    key_bytes,
                    hash,
                    kind: PendingKind::Read,
                };
                Ok(self.go_pending(core, serial, op, address))
            }
        }
    }

    /// Append a record that does not depend on the current value
    fn append_blind(
        &mut self,
        core: &StoreCore,
        serial: u64,
        key_bytes: &[u8],
        value_bytes: &[u8],
        hash: KeyHash,
        tombstone: bool,
    ) -> Result<()> {
        loop {
            let slot = core.index.find_or_create_slot(hash, self.slot)?;
            let entry = slot.entry();
            if entry.is_migrated() {
                continue;
            }
            // Only the in-memory head is checked; on-disk records are older
            if let RecordRead::Found(head) = core.hlog.read(entry.address())? {
                if head.version() > self.version && self.cpr_shift(core, serial) {
                    continue;
                }
            }

            let address = core.hlog.append(
                key_bytes,
                value_bytes,
                entry.address(),
                self.version,
                tombstone,
                self.slot,
            )?;
            if core.index.try_update(&slot, entry, address, tombstone) {
                return Ok(());
            }
            core.hlog.mark_invalid(address);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rmw_internal(
        &mut self,
        core: &StoreCore,
        serial: u64,
        key: &K,
        key_bytes: Bytes,
        hash: KeyHash,
        input: F::Input,
        mut known: Option<Known<V>>,
    ) -> Result<Status<V>> {
        loop {
            let slot = core.index.find_or_create_slot(hash, self.slot)?;
            let entry = slot.entry();
            if entry.is_migrated() {
                continue;
            }

            let current = match known.take() {
                Some(known) if known.expected == entry.address() => known.value,
                _ => match self.trace(core, entry.address(), &key_bytes)? {
                    Trace::OnDisk(address) => {
                        let op = PendingOperation {
                            key: key.clone(),
                            key_bytes,
                            hash,
                            kind: PendingKind::Rmw {
                                input,
                                expected: entry.address(),
                            },
                        };
                        return Ok(self.go_pending(core, serial, op, address));
                    }
                    Trace::Found(record) => {
                        if record.version() > self.version && self.cpr_shift(core, serial) {
                            continue;
                        }
                        if record.is_tombstone() {
                            None
                        } else {
                            Some(Self::decode_value(core, &record)?)
                        }
                    }
                    Trace::Absent => None,
                },
            };

            let (value, status) = match current {
                Some(old) => match self.functions.merge(&old, &input) {
                    Some(merged) => {
                        let status = Status::Found(merged.clone());
                        (merged, status)
                    }
                    None => return Ok(Status::Found(old)),
                },
                None => (self.functions.initial_value(&input), Status::NotFound),
            };

            let value_bytes = encode(&value)?;
            let address = core.hlog.append(
                &key_bytes,
                &value_bytes,
                entry.address(),
                self.version,
                false,
                self.slot,
            )?;
            if core.index.try_update(&slot, entry, address, false) {
                return Ok(status);
            }
            core.hlog.mark_invalid(address);
            self.functions.dispose(value);
        }
    }

    fn go_pending(
        &mut self,
        core: &StoreCore,
        serial: u64,
        op: PendingOperation<K, F::Input>,
        address: Address,
    ) -> Status<V> {
        self.shared.state.lock().pending.insert(serial);
        self.pending.insert(serial, op);

        let tx = self.io_tx.clone();
        let notify = Arc::clone(&self.notify);
        core.hlog.read_async(address, move |result| {
            // The session may have closed; its operations are dropped
            let _ = tx.send(IoCompletion { serial, result });
            notify.notify_one();
        });
        trace!("Operation {} pending on {}", serial, address);
        Status::Pending(serial)
    }

    fn drain_completions(&mut self, core: &StoreCore) {
        while let Some(completion) = self
            .inbox
            .pop_front()
            .or_else(|| self.io_rx.try_recv().ok())
        {
            self.handle_completion(core, completion);
        }
    }

    fn handle_completion(&mut self, core: &StoreCore, completion: IoCompletion) {
        let IoCompletion { serial, result } = completion;
        let Some(op) = self.pending.remove(&serial) else {
            warn!("Completion for unknown operation {}", serial);
            return;
        };
        let key = op.key.clone();
        let kind = match op.kind {
            PendingKind::Read => OperationKind::Read,
            PendingKind::Rmw { .. } => OperationKind::Rmw,
        };

        let result = result.and_then(|record| self.resume(core, serial, op, record));
        if matches!(result, Ok(Status::Pending(_))) {
            return;
        }
        if let Err(e) = &result {
            warn!("Operation {} of session {} failed: {}", serial, self.id, e);
        }
        self.shared.state.lock().pending.remove(&serial);
        self.ready.push_back(CompletedOperation {
            serial,
            key,
            kind,
            result,
        });
    }

    /// Continue an operation with the record its device read returned
    fn resume(
        &mut self,
        core: &StoreCore,
        serial: u64,
        op: PendingOperation<K, F::Input>,
        record: LogRecord,
    ) -> Result<Status<V>> {
        let found = if !record.is_invalid() && record.key == op.key_bytes {
            Some(record)
        } else {
            match self.trace(core, record.prev(), &op.key_bytes)? {
                Trace::Found(record) => Some(record),
                Trace::Absent => None,
                Trace::OnDisk(address) => return Ok(self.go_pending(core, serial, op, address)),
            }
        };

        match op.kind {
            PendingKind::Read => Self::record_status(core, found.as_ref()),
            PendingKind::Rmw { input, expected } => {
                if let Some(record) = &found {
                    if record.version() > self.version {
                        self.cpr_shift(core, serial);
                    }
                }
                let value = match &found {
                    Some(record) if !record.is_tombstone() => {
                        Some(Self::decode_value(core, record)?)
                    }
                    _ => None,
                };
                self.rmw_internal(
                    core,
                    serial,
                    &op.key,
                    op.key_bytes,
                    op.hash,
                    input,
                    Some(Known { expected, value }),
                )
            }
        }
    }
}

impl<K, V, F: Functions<V>> Drop for Session<K, V, F> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                "Session {} closed with {} pending operations",
                self.id,
                self.pending.len()
            );
        }
        self.store.core.unregister_session(self.id);
        self.store.core.epoch.release_slot(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{SimpleFunctions, TryAddFunctions, sum_functions};
    use hybridkv_common::{CheckpointKind, StoreConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    fn small_config() -> StoreConfig {
        let mut config = StoreConfig::default();
        config.index.slot_count = 1 << 10;
        config.log.page_bits = 12;
        config.log.memory_bits = 15;
        config
    }

    #[test]
    fn test_upsert_read_delete() {
        let store: Store<u64, String> = Store::open(small_config()).unwrap();
        let mut session = store.new_session(TryAddFunctions::new()).unwrap();

        assert_eq!(session.read(&7).unwrap(), Status::NotFound);
        session.upsert(&7, &"seven".to_string()).unwrap();
        assert_eq!(session.read(&7).unwrap(), Status::Found("seven".to_string()));

        session.upsert(&7, &"SEVEN".to_string()).unwrap();
        assert_eq!(session.read(&7).unwrap(), Status::Found("SEVEN".to_string()));

        session.delete(&7).unwrap();
        assert_eq!(session.read(&7).unwrap(), Status::NotFound);
        // Deleting an unknown key writes nothing
        let tail = store.stats().log.tail_address;
        session.delete(&8).unwrap();
        assert_eq!(store.stats().log.tail_address, tail);
        assert_eq!(session.serial(), 8);
    }

    #[test]
    fn test_rmw_sum() {
        let store: Store<u64, u64> = Store::open(small_config()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();

        assert_eq!(session.rmw(&2, 25).unwrap(), Status::NotFound);
        assert_eq!(session.rmw(&2, 27).unwrap(), Status::Found(52));
        assert_eq!(session.read(&2).unwrap(), Status::Found(52));

        session.delete(&2).unwrap();
        assert_eq!(session.rmw(&2, 1).unwrap(), Status::NotFound);
        assert_eq!(session.read(&2).unwrap(), Status::Found(1));
    }

    #[test]
    fn test_try_add() {
        let store: Store<String, String> = Store::open(small_config()).unwrap();
        let mut session = store.new_session(TryAddFunctions::new()).unwrap();
        let key = "k".to_string();

        assert_eq!(session.rmw(&key, "first".into()).unwrap(), Status::NotFound);
        assert_eq!(
            session.rmw(&key, "second".into()).unwrap(),
            Status::Found("first".to_string())
        );
        assert_eq!(session.read(&key).unwrap(), Status::Found("first".to_string()));
    }

    #[test]
    fn test_pending_read_after_evict() {
        let store: Store<u64, u64> = Store::open(small_config()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        session.upsert(&1, &100).unwrap();
        store.flush_and_evict(true).unwrap();

        let Status::Pending(serial) = session.read(&1).unwrap() else {
            panic!("expected a pending read");
        };
        assert_eq!(session.pending_count(), 1);
        let done = session.complete_pending(true).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].serial, serial);
        assert_eq!(done[0].key, 1);
        assert_eq!(done[0].kind, OperationKind::Read);
        assert_eq!(done[0].result.as_ref().unwrap(), &Status::Found(100));

        // Served from the read cache now
        assert_eq!(session.read(&1).unwrap(), Status::Found(100));
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_pending_rmw_after_evict() {
        let store: Store<u64, u64> = Store::open(small_config()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        session.rmw(&5, 10).unwrap();
        store.flush_and_evict(true).unwrap();

        assert!(session.rmw(&5, 5).unwrap().is_pending());
        let done = session.complete_pending(true).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].kind, OperationKind::Rmw);
        assert_eq!(done[0].result.as_ref().unwrap(), &Status::Found(15));
        assert_eq!(session.read(&5).unwrap(), Status::Found(15));
    }

    #[test]
    fn test_large_values_use_object_log() {
        let mut config = small_config();
        config.log.object_log_threshold = 128;
        let store: Store<u64, Vec<u8>> = Store::open(config).unwrap();
        let mut session = store
            .new_session(SimpleFunctions::new(|a: &Vec<u8>, b: &Vec<u8>| {
                [a.as_slice(), b.as_slice()].concat()
            }))
            .unwrap();

        let big = vec![0xAB; 2000];
        session.upsert(&1, &big).unwrap();
        assert!(store.stats().log.object_log_bytes > 0);
        assert_eq!(session.read(&1).unwrap(), Status::Found(big.clone()));

        store.flush_and_evict(true).unwrap();
        assert!(session.read(&1).unwrap().is_pending());
        let done = session.complete_pending(true).unwrap();
        assert_eq!(done[0].result.as_ref().unwrap(), &Status::Found(big));
    }

    #[tokio::test]
    async fn test_async_operations() {
        let store: Store<u64, u64> = Store::open(small_config()).unwrap();
        let mut session = store.new_session(sum_functions::<u64>()).unwrap();
        session.upsert(&1, &1).unwrap();
        session.upsert(&2, &2).unwrap();
        store.flush_and_evict(true).unwrap();

        // Left pending for the next drain
        assert!(session.read(&2).unwrap().is_pending());
        assert_eq!(session.read_async(&1).await.unwrap(), Status::Found(1));
        assert_eq!(session.rmw_async(&1, 41).await.unwrap(), Status::Found(42));

        let done = session.complete_pending(true).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, 2);
    }

    struct Recording {
        serial: Arc<AtomicU64>,
    }

    impl Functions<u64> for Recording {
        type Input = u64;

        fn initial_value(&self, input: &u64) -> u64 {
            *input
        }

        fn merge(&self, current: &u64, input: &u64) -> Option<u64> {
            Some(current + input)
        }

        fn checkpoint_completed(&self, _session: SessionId, serial: u64) {
            self.serial.store(serial, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_commit_points_and_notification() {
        let dir = tempdir().unwrap();
        let mut config = small_config();
        config.checkpoint.dir = Some(dir.path().to_path_buf());
        let store: Store<u64, u64> = Store::open(config).unwrap();
        let notified = Arc::new(AtomicU64::new(0));
        let mut session = store
            .new_session(Recording {
                serial: Arc::clone(&notified),
            })
            .unwrap();

        for i in 0..3 {
            session.upsert(&i, &i).unwrap();
        }
        let first = store.checkpoint(CheckpointKind::Snapshot).unwrap();
        assert_eq!(first.sessions[&session.id()].until_serial, 3);
        assert!(first.sessions[&session.id()].excluded_serials.is_empty());

        // The next operation moves the session to version 2 and reports
        // the durable prefix
        session.upsert(&3, &3).unwrap();
        assert_eq!(session.version(), 2);
        assert_eq!(notified.load(Ordering::SeqCst), 3);

        let second = store.checkpoint(CheckpointKind::FoldOver).unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.sessions[&session.id()].until_serial, 4);
    }

    #[test]
    fn test_pending_operations_excluded_from_cut() {
        let shared = SessionShared::new(1, 0);
        {
            let mut state = shared.state.lock();
            state.serial = 10;
            state.pending.insert(8);
        }
        let commit = shared.commit_for(1);
        assert_eq!(commit.until_serial, 10);
        assert_eq!(commit.excluded_serials, vec![8]);

        {
            let mut state = shared.state.lock();
            state.version = 2;
            state.cut = Some((
                2,
                SessionCommit {
                    until_serial: 6,
                    excluded_serials: vec![5],
                },
            ));
        }
        assert_eq!(shared.commit_for(1).until_serial, 6);
        assert_eq!(shared.commit_for(2).until_serial, 10);
    }
}
