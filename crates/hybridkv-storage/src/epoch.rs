//! Epoch protection and cooperative phase transitions
//!
//! Every thread touching shared log memory publishes the epoch it entered at
//! in one slot of a fixed table. Work that must not run while older threads
//! may still observe some state (freeing a page frame, flushing a page that
//! was just made read-only) is registered with [`LightEpoch::bump_with_action`]
//! and runs once every protected thread has moved past the bump.
//!
//! The same table carries a global [`SystemState`]. Each slot records the
//! last state it acknowledged, which lets a coordinator advance a multi-phase
//! protocol (checkpointing) without stopping any thread.

use hybridkv_common::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Number of epoch slots, and therefore of concurrently open sessions
pub const EPOCH_TABLE_SIZE: usize = 128;

/// Slot value meaning "not protected"
const UNPROTECTED: u64 = 0;

/// Deferred work executed once its epoch is safe
pub type EpochAction = Box<dyn FnOnce() + Send + 'static>;

/// Checkpoint protocol phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Rest = 0,
    Prepare = 1,
    InProgress = 2,
    WaitFlush = 3,
    PersistenceCallback = 4,
}

impl Phase {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Prepare,
            2 => Self::InProgress,
            3 => Self::WaitFlush,
            4 => Self::PersistenceCallback,
            _ => Self::Rest,
        }
    }
}

/// Global phase and version, packed into one word
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SystemState {
    pub phase: Phase,
    pub version: u32,
}

impl SystemState {
    /// State of a freshly opened store
    pub const INITIAL: Self = Self::rest(1);

    #[must_use]
    pub const fn new(phase: Phase, version: u32) -> Self {
        Self { phase, version }
    }

    #[must_use]
    pub const fn rest(version: u32) -> Self {
        Self::new(Phase::Rest, version)
    }

    const fn pack(self) -> u64 {
        ((self.version as u64) << 8) | self.phase as u64
    }

    const fn unpack(word: u64) -> Self {
        Self {
            phase: Phase::from_u8((word & 0xFF) as u8),
            version: (word >> 8) as u32,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.phase, self.version)
    }
}

#[repr(align(64))]
struct EpochSlot {
    local: AtomicU64,
    acked: AtomicU64,
    owned: AtomicBool,
}

impl EpochSlot {
    const fn new() -> Self {
        Self {
            local: AtomicU64::new(UNPROTECTED),
            acked: AtomicU64::new(0),
            owned: AtomicBool::new(false),
        }
    }
}

/// Epoch table, deferred action list, and global system state
pub struct LightEpoch {
    current: AtomicU64,
    safe: AtomicU64,
    slots: Box<[EpochSlot]>,
    drain_list: Mutex<Vec<(u64, EpochAction)>>,
    drain_count: AtomicUsize,
    state: AtomicU64,
}

impl LightEpoch {
    /// Create an epoch table in the given system state
    pub fn new(state: SystemState) -> Self {
        Self {
            current: AtomicU64::new(1),
            safe: AtomicU64::new(0),
            slots: (0..EPOCH_TABLE_SIZE).map(|_| EpochSlot::new()).collect(),
            drain_list: Mutex::new(Vec::new()),
            drain_count: AtomicUsize::new(0),
            state: AtomicU64::new(state.pack()),
        }
    }

    /// Claim a slot for the lifetime of a session
    pub fn acquire_slot(&self) -> Result<usize> {
        let state = self.state.load(Ordering::SeqCst);
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .owned
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                slot.local.store(UNPROTECTED, Ordering::SeqCst);
                slot.acked.store(state, Ordering::SeqCst);
                return Ok(i);
            }
        }
        Err(Error::invalid_state(format!(
            "all {EPOCH_TABLE_SIZE} epoch slots are in use"
        )))
    }

    /// Return a slot to the table
    pub fn release_slot(&self, slot: usize) {
        self.unprotect(slot);
        self.slots[slot].owned.store(false, Ordering::SeqCst);
    }

    /// Temporary protected slot for store-level callers
    pub fn guard(&self) -> Result<EpochGuard<'_>> {
        let slot = self.acquire_slot()?;
        self.protect(slot);
        Ok(EpochGuard { epoch: self, slot })
    }

    /// Enter the current epoch
    pub fn protect(&self, slot: usize) -> u64 {
        let epoch = self.current.load(Ordering::SeqCst);
        self.slots[slot].local.store(epoch, Ordering::SeqCst);
        epoch
    }

    /// Leave the protected region
    pub fn unprotect(&self, slot: usize) {
        self.slots[slot].local.store(UNPROTECTED, Ordering::SeqCst);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.try_drain();
        }
    }

    /// Move a protected slot to the current epoch and run ready actions
    pub fn refresh(&self, slot: usize) -> u64 {
        let epoch = self.current.load(Ordering::SeqCst);
        self.slots[slot].local.store(epoch, Ordering::SeqCst);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.try_drain();
        }
        epoch
    }

    /// Whether the slot is currently protected
    pub fn is_protected(&self, slot: usize) -> bool {
        self.slots[slot].local.load(Ordering::SeqCst) != UNPROTECTED
    }

    /// Advance the global epoch, returning the new value
    pub fn bump_current_epoch(&self) -> u64 {
        let next = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.try_drain();
        }
        next
    }

    /// Advance the global epoch and run `action` once no thread can still
    /// be in the epoch before the bump
    pub fn bump_with_action(&self, action: impl FnOnce() + Send + 'static) {
        let prior = self.current.fetch_add(1, Ordering::SeqCst);
        {
            let mut list = self.drain_list.lock();
            list.push((prior, Box::new(action)));
            self.drain_count.fetch_add(1, Ordering::Release);
        }
        self.try_drain();
    }

    /// Current global epoch
    pub fn current_epoch(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Largest epoch no protected thread can still be in
    pub fn safe_epoch(&self) -> u64 {
        self.compute_safe_epoch()
    }

    /// Deferred actions not yet executed
    pub fn pending_actions(&self) -> usize {
        self.drain_count.load(Ordering::Acquire)
    }

    fn compute_safe_epoch(&self) -> u64 {
        let mut oldest = self.current.load(Ordering::SeqCst);
        for slot in self.slots.iter() {
            let local = slot.local.load(Ordering::SeqCst);
            if local != UNPROTECTED && local < oldest {
                oldest = local;
            }
        }
        let safe = oldest - 1;
        self.safe.fetch_max(safe, Ordering::SeqCst);
        safe
    }

    /// Run every action whose epoch is safe. Never blocks: if another
    /// thread holds the list, the actions wait for a later refresh.
    fn try_drain(&self) {
        let safe = self.compute_safe_epoch();
        let ready = {
            let Some(mut list) = self.drain_list.try_lock() else {
                return;
            };
            let (ready, waiting): (Vec<_>, Vec<_>) =
                list.drain(..).partition(|(epoch, _)| *epoch <= safe);
            *list = waiting;
            self.drain_count.fetch_sub(ready.len(), Ordering::Release);
            ready
        };
        for (_, action) in ready {
            action();
        }
    }

    /// Current system state
    pub fn system_state(&self) -> SystemState {
        SystemState::unpack(self.state.load(Ordering::SeqCst))
    }

    /// CAS the system state
    pub fn try_advance(&self, from: SystemState, to: SystemState) -> bool {
        self.state
            .compare_exchange(from.pack(), to.pack(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditionally set the system state (recovery only)
    pub fn reset_state(&self, state: SystemState) {
        self.state.store(state.pack(), Ordering::SeqCst);
        for slot in self.slots.iter() {
            slot.acked.store(state.pack(), Ordering::SeqCst);
        }
    }

    /// Observe the system state from `slot`, running `trigger` if the slot
    /// has not acknowledged it yet
    pub fn refresh_phase(&self, slot: usize, trigger: impl FnOnce(SystemState)) -> SystemState {
        let word = self.state.load(Ordering::SeqCst);
        if self.slots[slot].acked.load(Ordering::SeqCst) != word {
            trigger(SystemState::unpack(word));
            self.slots[slot].acked.store(word, Ordering::SeqCst);
        }
        SystemState::unpack(word)
    }

    /// Whether every protected slot has acknowledged `state`
    pub fn is_phase_complete(&self, state: SystemState) -> bool {
        let word = state.pack();
        self.slots.iter().all(|slot| {
            !slot.owned.load(Ordering::SeqCst)
                || slot.local.load(Ordering::SeqCst) == UNPROTECTED
                || slot.acked.load(Ordering::SeqCst) == word
        })
    }

    /// Number of slots currently claimed
    pub fn active_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.owned.load(Ordering::Relaxed))
            .count()
    }
}

/// A protected epoch slot released on drop
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
    slot: usize,
}

impl EpochGuard<'_> {
    /// Slot index held by this guard
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Refresh the guarded slot
    pub fn refresh(&self) -> u64 {
        self.epoch.refresh(self.slot)
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.release_slot(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_packing() {
        let state = SystemState::new(Phase::WaitFlush, 42);
        assert_eq!(SystemState::unpack(state.pack()), state);
        assert_eq!(SystemState::INITIAL, SystemState::rest(1));
        assert_eq!(state.to_string(), "WaitFlush(42)");
    }

    #[test]
    fn test_action_waits_for_protected_slot() {
        let epoch = LightEpoch::new(SystemState::INITIAL);
        let slot = epoch.acquire_slot().unwrap();
        epoch.protect(slot);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        epoch.bump_with_action(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        // The slot still sits in the pre-bump epoch
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(epoch.pending_actions(), 1);

        epoch.refresh(slot);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(epoch.pending_actions(), 0);
        epoch.release_slot(slot);
    }

    #[test]
    fn test_action_runs_immediately_without_protection() {
        let epoch = LightEpoch::new(SystemState::INITIAL);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        epoch.bump_with_action(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unprotect_drains() {
        let epoch = LightEpoch::new(SystemState::INITIAL);
        let guard = epoch.guard().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        epoch.bump_with_action(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        drop(guard);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(epoch.active_slots(), 0);
    }

    #[test]
    fn test_nested_actions() {
        let epoch = Arc::new(LightEpoch::new(SystemState::INITIAL));
        let ran = Arc::new(AtomicUsize::new(0));

        let (e, r) = (Arc::clone(&epoch), Arc::clone(&ran));
        epoch.bump_with_action(move || {
            let r2 = Arc::clone(&r);
            e.bump_with_action(move || {
                r2.fetch_add(10, Ordering::SeqCst);
            });
            r.fetch_add(1, Ordering::SeqCst);
        });

        epoch.bump_current_epoch();
        assert_eq!(ran.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_phase_completion_ignores_unprotected() {
        let epoch = LightEpoch::new(SystemState::INITIAL);
        let a = epoch.acquire_slot().unwrap();
        let b = epoch.acquire_slot().unwrap();

        let prepare = SystemState::new(Phase::Prepare, 1);
        assert!(epoch.try_advance(SystemState::INITIAL, prepare));
        assert!(!epoch.try_advance(SystemState::INITIAL, prepare));

        // Neither slot is protected
        assert!(epoch.is_phase_complete(prepare));

        epoch.protect(a);
        assert!(!epoch.is_phase_complete(prepare));

        let mut seen = None;
        epoch.refresh_phase(a, |s| seen = Some(s));
        assert_eq!(seen, Some(prepare));
        assert!(epoch.is_phase_complete(prepare));

        // A second refresh does not re-run the trigger
        let mut again = false;
        epoch.refresh_phase(a, |_| again = true);
        assert!(!again);

        epoch.protect(b);
        assert!(!epoch.is_phase_complete(prepare));
        epoch.unprotect(b);
        assert!(epoch.is_phase_complete(prepare));

        epoch.release_slot(a);
        epoch.release_slot(b);
    }

    #[test]
    fn test_slot_exhaustion() {
        let epoch = LightEpoch::new(SystemState::INITIAL);
        let slots: Vec<_> = (0..EPOCH_TABLE_SIZE)
            .map(|_| epoch.acquire_slot().unwrap())
            .collect();
        assert!(matches!(epoch.acquire_slot(), Err(Error::InvalidState(_))));
        epoch.release_slot(slots[7]);
        assert_eq!(epoch.acquire_slot().unwrap(), 7);
    }

    #[test]
    fn test_safe_epoch_tracks_oldest() {
        let epoch = LightEpoch::new(SystemState::INITIAL);
        let slot = epoch.acquire_slot().unwrap();
        let entered = epoch.protect(slot);
        for _ in 0..5 {
            epoch.bump_current_epoch();
        }
        assert_eq!(epoch.safe_epoch(), entered - 1);
        epoch.refresh(slot);
        epoch.bump_current_epoch();
        assert_eq!(epoch.safe_epoch(), entered + 4);
        epoch.release_slot(slot);
    }
}
