//! Concurrent hash index
//!
//! Maps a 64-bit key hash to the address of the newest log record for that
//! key. The table is open addressed with linear probing. A slot's hash is
//! claimed once by CAS and never released; its entry word is only ever
//! changed by CAS.
//!
//! Growing the table runs on a background thread in three steps:
//! 1. `Prepare`: a table twice the size is allocated; creation of unseen
//!    hashes waits (refreshing its epoch) so nothing new lands in the old
//!    table once the epoch barrier passes.
//! 2. `InProgress`: both tables are live. Lookups check the old table first
//!    and follow migrated entries into the new one; creations go to the new
//!    table, which holds back one slot per old entry and makes creations
//!    wait for the swap once the rest is used up. The migrator copies each entry and then CAS-marks the old entry
//!    migrated, retrying when a concurrent update wins.
//! 3. The new table becomes current.

use crate::epoch::LightEpoch;
use hybridkv_common::{Address, Error, KeyHash, Result, types::ADDRESS_BITS};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const TAG_SHIFT: u32 = ADDRESS_BITS;
const TAG_MASK: u64 = (1 << KeyHash::TAG_BITS) - 1;
const UNLIMITED: u64 = u64::MAX;
const TOMBSTONE_BIT: u64 = 1 << 62;
const MIGRATED_BIT: u64 = 1 << 63;

/// Packed index entry: address, tag, tombstone hint, migrated flag
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexEntry(u64);

impl IndexEntry {
    /// Entry of an unused slot
    pub const EMPTY: Self = Self(0);

    /// Pack an entry
    #[must_use]
    pub const fn new(address: Address, tag: u16, tombstone: bool) -> Self {
        let mut word = (address.raw() & ADDRESS_MASK) | (((tag as u64) & TAG_MASK) << TAG_SHIFT);
        if tombstone {
            word |= TOMBSTONE_BIT;
        }
        Self(word)
    }

    /// Wrap a raw word
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Address of the newest record
    #[must_use]
    pub const fn address(self) -> Address {
        Address::new(self.0 & ADDRESS_MASK)
    }

    #[must_use]
    pub const fn tag(self) -> u16 {
        ((self.0 >> TAG_SHIFT) & TAG_MASK) as u16
    }

    /// The newest record is a tombstone
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & TOMBSTONE_BIT != 0
    }

    /// The entry has been copied into a newer table
    #[must_use]
    pub const fn is_migrated(self) -> bool {
        self.0 & MIGRATED_BIT != 0
    }

    const fn migrated(self) -> Self {
        Self(self.0 | MIGRATED_BIT)
    }
}

impl std::fmt::Debug for IndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("address", &self.address())
            .field("tag", &self.tag())
            .field("tombstone", &self.is_tombstone())
            .field("migrated", &self.is_migrated())
            .finish()
    }
}

struct Slot {
    hash: AtomicU64,
    entry: AtomicU64,
}

struct Table {
    slots: Box<[Slot]>,
    claimed: AtomicU64,
    /// Slots new hashes may still claim; the rest is held for migration
    creation_budget: AtomicU64,
}

impl Table {
    fn new(size: u64) -> Self {
        Self {
            slots: (0..size)
                .map(|_| Slot {
                    hash: AtomicU64::new(0),
                    entry: AtomicU64::new(0),
                })
                .collect(),
            claimed: AtomicU64::new(0),
            creation_budget: AtomicU64::new(UNLIMITED),
        }
    }

    /// Keep `reserved` slots free for entries migrated from an older table
    fn reserve_for_migration(&self, reserved: u64) {
        self.creation_budget
            .store(self.size().saturating_sub(reserved), Ordering::SeqCst);
    }

    fn lift_creation_limit(&self) {
        self.creation_budget.store(UNLIMITED, Ordering::SeqCst);
    }

    fn take_creation_budget(&self) -> bool {
        self.creation_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                left => Some(left - 1),
            })
            .is_ok()
    }

    fn return_creation_budget(&self) {
        let _ = self
            .creation_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
                UNLIMITED => None,
                left => Some(left + 1),
            });
    }

    fn size(&self) -> u64 {
        self.slots.len() as u64
    }

    fn find(&self, hash: KeyHash) -> Option<usize> {
        let size = self.size();
        let home = hash.home(size);
        for step in 0..size {
            let idx = ((home + step) & (size - 1)) as usize;
            match self.slots[idx].hash.load(Ordering::Acquire) {
                h if h == hash.raw() => return Some(idx),
                0 => return None,
                _ => {}
            }
        }
        None
    }

    /// Find the slot for `hash`, claiming an empty one if absent
    ///
    /// New hashes draw on the creation budget; migrated ones use the
    /// reserved slots.
    fn find_or_claim(&self, hash: KeyHash, migrating: bool) -> Result<(usize, bool)> {
        let size = self.size();
        let home = hash.home(size);
        for step in 0..size {
            let idx = ((home + step) & (size - 1)) as usize;
            let slot = &self.slots[idx];
            let current = slot.hash.load(Ordering::Acquire);
            if current == hash.raw() {
                return Ok((idx, false));
            }
            if current == 0 {
                if !migrating && !self.take_creation_budget() {
                    return Err(Error::CapacityExceeded { slots: size });
                }
                match slot
                    .hash
                    .compare_exchange(0, hash.raw(), Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.claimed.fetch_add(1, Ordering::Relaxed);
                        return Ok((idx, true));
                    }
                    Err(actual) => {
                        if !migrating {
                            self.return_creation_budget();
                        }
                        if actual == hash.raw() {
                            return Ok((idx, false));
                        }
                    }
                }
            }
        }
        Err(Error::CapacityExceeded { slots: size })
    }
}

/// Reference to one index slot
#[derive(Clone)]
pub struct SlotRef {
    table: Arc<Table>,
    index: usize,
}

impl SlotRef {
    /// Current entry
    pub fn entry(&self) -> IndexEntry {
        IndexEntry(self.table.slots[self.index].entry.load(Ordering::Acquire))
    }

    /// Full hash stored in the slot
    pub fn hash(&self) -> KeyHash {
        KeyHash::from_raw(self.table.slots[self.index].hash.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRef")
            .field("index", &self.index)
            .field("entry", &self.entry())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ResizePhase {
    Rest = 0,
    Prepare = 1,
    InProgress = 2,
}

impl ResizePhase {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Prepare,
            2 => Self::InProgress,
            _ => Self::Rest,
        }
    }
}

struct Tables {
    current: Arc<Table>,
    next: Option<Arc<Table>>,
}

struct View {
    current: Arc<Table>,
    next: Option<Arc<Table>>,
    phase: ResizePhase,
}

/// Persisted form of the index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Table size when the snapshot was taken
    pub size: u64,
    /// `(hash, entry)` pairs of every slot with a record
    pub entries: Vec<(u64, IndexEntry)>,
}

/// Index statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStats {
    pub size: u64,
    pub claimed: u64,
    pub load_factor: f64,
    pub resizes: u64,
}

/// Resizable lock-free hash index
pub struct HashIndex {
    tables: RwLock<Tables>,
    phase: AtomicU8,
    epoch: Arc<LightEpoch>,
    grow_load_factor: f64,
    initial_size: u64,
    resize_lock: Mutex<()>,
    resize_running: AtomicBool,
    resizes: AtomicU64,
}

impl HashIndex {
    /// Create an index with `size` slots (a power of two)
    pub fn new(size: u64, grow_load_factor: f64, epoch: Arc<LightEpoch>) -> Self {
        Self {
            tables: RwLock::new(Tables {
                current: Arc::new(Table::new(size)),
                next: None,
            }),
            phase: AtomicU8::new(ResizePhase::Rest as u8),
            epoch,
            grow_load_factor,
            initial_size: size,
            resize_lock: Mutex::new(()),
            resize_running: AtomicBool::new(false),
            resizes: AtomicU64::new(0),
        }
    }

    fn view(&self) -> View {
        let tables = self.tables.read();
        View {
            current: Arc::clone(&tables.current),
            next: tables.next.clone(),
            phase: ResizePhase::from_u8(self.phase.load(Ordering::SeqCst)),
        }
    }

    /// Resolve `hash` in a view. `Err(())` means the view went stale.
    fn lookup(view: &View, hash: KeyHash) -> std::result::Result<Option<SlotRef>, ()> {
        if let Some(index) = view.current.find(hash) {
            let entry = IndexEntry(view.current.slots[index].entry.load(Ordering::Acquire));
            if !entry.is_migrated() {
                return Ok(Some(SlotRef {
                    table: Arc::clone(&view.current),
                    index,
                }));
            }
            let next = view.next.as_ref().ok_or(())?;
            return Ok(next.find(hash).map(|index| SlotRef {
                table: Arc::clone(next),
                index,
            }));
        }
        if view.phase == ResizePhase::InProgress {
            if let Some(next) = &view.next {
                return Ok(next.find(hash).map(|index| SlotRef {
                    table: Arc::clone(next),
                    index,
                }));
            }
        }
        Ok(None)
    }

    /// Find the slot for `hash` without creating one
    pub fn find_slot(&self, hash: KeyHash) -> Option<SlotRef> {
        loop {
            if let Ok(found) = Self::lookup(&self.view(), hash) {
                return found;
            }
        }
    }

    /// Find the slot for `hash`, claiming one if needed
    ///
    /// `epoch_slot` must be protected; it is refreshed while waiting for a
    /// resize so the resize barrier can pass.
    pub fn find_or_create_slot(
        self: &Arc<Self>,
        hash: KeyHash,
        epoch_slot: usize,
    ) -> Result<SlotRef> {
        loop {
            let view = self.view();
            match Self::lookup(&view, hash) {
                Ok(Some(slot)) => return Ok(slot),
                Ok(None) => {}
                Err(()) => continue,
            }

            let target = match view.phase {
                ResizePhase::Rest => &view.current,
                ResizePhase::Prepare => {
                    self.wait_for_resize_step(epoch_slot);
                    continue;
                }
                ResizePhase::InProgress => match &view.next {
                    Some(next) => next,
                    None => continue,
                },
            };

            match target.find_or_claim(hash, false) {
                Ok((index, created)) => {
                    if created {
                        self.maybe_grow(target);
                    }
                    return Ok(SlotRef {
                        table: Arc::clone(target),
                        index,
                    });
                }
                Err(Error::CapacityExceeded { slots }) => {
                    debug!("Index full at {} slots, waiting for resize", slots);
                    self.request_resize();
                    self.wait_for_resize_step(epoch_slot);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_for_resize_step(&self, epoch_slot: usize) {
        self.epoch.refresh(epoch_slot);
        thread::yield_now();
    }

    /// CAS the slot's entry; false if it changed or was migrated
    pub fn try_update(
        &self,
        slot: &SlotRef,
        expected: IndexEntry,
        new_address: Address,
        tombstone: bool,
    ) -> bool {
        let new = IndexEntry::new(new_address, slot.hash().tag(), tombstone);
        slot.table.slots[slot.index]
            .entry
            .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn maybe_grow(self: &Arc<Self>, table: &Table) {
        let claimed = table.claimed.load(Ordering::Relaxed);
        if claimed as f64 > table.size() as f64 * self.grow_load_factor {
            self.request_resize();
        }
    }

    /// Start a background resize unless one is already running
    pub fn request_resize(self: &Arc<Self>) {
        if self
            .resize_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let index = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("hybridkv-index-resize".into())
            .spawn(move || {
                loop {
                    index.resize();
                    if !index.over_threshold() {
                        break;
                    }
                }
                index.resize_running.store(false, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn index resize thread: {}", e);
            self.resize_running.store(false, Ordering::SeqCst);
        }
    }

    fn over_threshold(&self) -> bool {
        let current = Arc::clone(&self.tables.read().current);
        current.claimed.load(Ordering::Relaxed) as f64
            > current.size() as f64 * self.grow_load_factor
    }

    /// Whether a background resize is running
    pub fn is_resizing(&self) -> bool {
        self.resize_running.load(Ordering::SeqCst)
    }

    /// Block until no resize is running (test and shutdown helper)
    pub fn wait_resize_idle(&self) {
        while self.is_resizing() {
            self.epoch.bump_current_epoch();
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Double the table. Runs on the resize thread.
    fn resize(&self) {
        let _lock = self.resize_lock.lock();

        let old = Arc::clone(&self.tables.read().current);
        let new = Arc::new(Table::new(old.size() * 2));
        debug!("Index resize {} -> {} slots: prepare", old.size(), new.size());

        self.tables.write().next = Some(Arc::clone(&new));
        self.phase
            .store(ResizePhase::Prepare as u8, Ordering::SeqCst);

        // Creations that observed Rest finish before migration begins
        let ready = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ready);
        self.epoch.bump_with_action(move || flag.store(true, Ordering::SeqCst));
        while !ready.load(Ordering::SeqCst) {
            self.epoch.bump_current_epoch();
            thread::sleep(Duration::from_micros(200));
        }
        // No creation lands in the old table past the barrier, so its count
        // is final: hold that many slots for the entries about to move over
        new.reserve_for_migration(old.claimed.load(Ordering::SeqCst));
        self.phase
            .store(ResizePhase::InProgress as u8, Ordering::SeqCst);

        let mut migrated = 0u64;
        for slot in old.slots.iter() {
            let hash = slot.hash.load(Ordering::Acquire);
            if hash == 0 {
                continue;
            }
            let hash = KeyHash::from_raw(hash);
            let Ok((index, _)) = new.find_or_claim(hash, true) else {
                // Unreachable while the reservation holds
                error!("Index migration found no slot for {:#x}", hash.raw());
                continue;
            };
            let target = &new.slots[index].entry;
            loop {
                let entry = IndexEntry(slot.entry.load(Ordering::Acquire));
                if entry.is_migrated() {
                    break;
                }
                target.store(entry.0, Ordering::Release);
                if slot
                    .entry
                    .compare_exchange(
                        entry.0,
                        entry.migrated().0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    migrated += 1;
                    break;
                }
            }
        }

        new.lift_creation_limit();
        {
            let mut tables = self.tables.write();
            tables.current = Arc::clone(&new);
            tables.next = None;
            self.phase.store(ResizePhase::Rest as u8, Ordering::SeqCst);
        }
        self.resizes.fetch_add(1, Ordering::Relaxed);
        info!(
            "Index resized from {} to {} slots ({} entries migrated)",
            old.size(),
            new.size(),
            migrated
        );
    }

    /// Copy all live entries, unless a resize holds the table
    pub fn try_snapshot(&self) -> Option<IndexSnapshot> {
        let _lock = self.resize_lock.try_lock()?;
        let current = Arc::clone(&self.tables.read().current);
        let entries = current
            .slots
            .iter()
            .filter_map(|slot| {
                let hash = slot.hash.load(Ordering::Acquire);
                let entry = IndexEntry(slot.entry.load(Ordering::Acquire));
                (hash != 0 && !entry.address().is_invalid()).then_some((hash, entry))
            })
            .collect();
        Some(IndexSnapshot {
            size: current.size(),
            entries,
        })
    }

    /// Replace the contents with a snapshot. No sessions may be active.
    pub fn restore(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let _lock = self.resize_lock.lock();

        let needed = (snapshot.entries.len() as f64 / self.grow_load_factor).ceil() as u64 + 1;
        let size = snapshot
            .size
            .max(self.initial_size)
            .max(needed.next_power_of_two());
        let table = Table::new(size);
        for (hash, entry) in &snapshot.entries {
            let (index, _) = table.find_or_claim(KeyHash::from_raw(*hash), true)?;
            table.slots[index].entry.store(entry.0, Ordering::Release);
        }

        let mut tables = self.tables.write();
        tables.current = Arc::new(table);
        tables.next = None;
        self.phase.store(ResizePhase::Rest as u8, Ordering::SeqCst);
        info!(
            "Restored index with {} entries into {} slots",
            snapshot.entries.len(),
            size
        );
        Ok(())
    }

    /// Drop every entry. No sessions may be active.
    pub fn clear(&self) {
        let _lock = self.resize_lock.lock();
        let mut tables = self.tables.write();
        tables.current = Arc::new(Table::new(self.initial_size));
        tables.next = None;
        self.phase.store(ResizePhase::Rest as u8, Ordering::SeqCst);
    }

    /// Get statistics
    pub fn stats(&self) -> IndexStats {
        let current = Arc::clone(&self.tables.read().current);
        let claimed = current.claimed.load(Ordering::Relaxed);
        IndexStats {
            size: current.size(),
            claimed,
            load_factor: claimed as f64 / current.size() as f64,
            resizes: self.resizes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::SystemState;
    use std::collections::HashSet;

    fn index(size: u64) -> Arc<HashIndex> {
        let epoch = Arc::new(LightEpoch::new(SystemState::INITIAL));
        Arc::new(HashIndex::new(size, 0.75, epoch))
    }

    #[test]
    fn test_entry_packing() {
        let entry = IndexEntry::new(Address::new(0x1234_5678), 0x3ABC, true);
        assert_eq!(entry.address(), Address::new(0x1234_5678));
        assert_eq!(entry.tag(), 0x3ABC);
        assert!(entry.is_tombstone());
        assert!(!entry.is_migrated());
        assert!(entry.migrated().is_migrated());
        assert_eq!(entry.migrated().address(), entry.address());
    }

    #[test]
    fn test_create_and_update() {
        let index = index(16);
        let guard = index.epoch.guard().unwrap();
        let hash = KeyHash::of(b"key-1");

        assert!(index.find_slot(hash).is_none());
        let slot = index.find_or_create_slot(hash, guard.slot()).unwrap();
        assert_eq!(slot.entry(), IndexEntry::EMPTY);

        assert!(index.try_update(&slot, IndexEntry::EMPTY, Address::new(64), false));
        // Stale expectation loses
        assert!(!index.try_update(&slot, IndexEntry::EMPTY, Address::new(128), false));

        let found = index.find_slot(hash).unwrap();
        assert_eq!(found.entry().address(), Address::new(64));
        assert_eq!(found.entry().tag(), hash.tag());
        assert_eq!(found.hash(), hash);

        // Same hash resolves to the same slot
        let again = index.find_or_create_slot(hash, guard.slot()).unwrap();
        assert_eq!(again.index, slot.index);
        assert_eq!(index.stats().claimed, 1);
    }

    #[test]
    fn test_colliding_home_slots_spill_over() {
        let index = index(4);
        let guard = index.epoch.guard().unwrap();
        // Same home slot in a 4-slot table
        let a = KeyHash::from_raw(0x10);
        let b = KeyHash::from_raw(0x20);
        let sa = index.find_or_create_slot(a, guard.slot()).unwrap();
        let sb = index.find_or_create_slot(b, guard.slot()).unwrap();
        assert_ne!(sa.index, sb.index);
        assert!(index.try_update(&sb, IndexEntry::EMPTY, Address::new(640), false));
        assert_eq!(index.find_slot(b).unwrap().entry().address(), Address::new(640));
        assert_eq!(index.find_slot(a).unwrap().entry(), IndexEntry::EMPTY);
    }

    #[test]
    fn test_grows_and_keeps_entries() {
        let index = index(8);
        {
            let guard = index.epoch.guard().unwrap();
            for i in 1..=100u64 {
                let hash = KeyHash::from_raw(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                loop {
                    let slot = index.find_or_create_slot(hash, guard.slot()).unwrap();
                    if index.try_update(&slot, slot.entry(), Address::new(i * 64), false) {
                        break;
                    }
                }
                guard.refresh();
            }
        }
        index.wait_resize_idle();

        let stats = index.stats();
        assert!(stats.size >= 128);
        assert!(stats.resizes >= 1);
        for i in 1..=100u64 {
            let hash = KeyHash::from_raw(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            assert_eq!(
                index.find_slot(hash).unwrap().entry().address(),
                Address::new(i * 64)
            );
        }
    }

    #[test]
    fn test_concurrent_insert_during_resize() {
        let index = index(16);
        let threads = 8u64;
        let per_thread = 1500u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    let guard = index.epoch.guard().unwrap();
                    for i in 0..per_thread {
                        let key = t * per_thread + i + 1;
                        let hash = KeyHash::of(&key.to_le_bytes());
                        loop {
                            let slot = index.find_or_create_slot(hash, guard.slot()).unwrap();
                            let entry = slot.entry();
                            if entry.is_migrated() {
                                continue;
                            }
                            if index.try_update(&slot, entry, Address::new(key * 64), false) {
                                break;
                            }
                        }
                        guard.refresh();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        index.wait_resize_idle();

        let total = threads * per_thread;
        assert_eq!(index.stats().claimed, total);

        let snapshot = index.try_snapshot().unwrap();
        assert_eq!(snapshot.entries.len() as u64, total);
        let distinct: HashSet<u64> = snapshot.entries.iter().map(|(h, _)| *h).collect();
        assert_eq!(distinct.len() as u64, total);

        for key in 1..=total {
            let hash = KeyHash::of(&key.to_le_bytes());
            let slot = index.find_slot(hash).expect("key lost during resize");
            assert_eq!(slot.entry().address(), Address::new(key * 64));
        }
    }

    #[test]
    fn test_creations_leave_room_for_migration() {
        let table = Table::new(8);
        // Five entries still to come from the old table
        table.reserve_for_migration(5);
        for i in 1..=3u64 {
            assert!(table.find_or_claim(KeyHash::from_raw(i), false).unwrap().1);
        }
        assert!(matches!(
            table.find_or_claim(KeyHash::from_raw(4), false),
            Err(Error::CapacityExceeded { slots: 8 })
        ));
        // Hashes already present are still found
        assert!(!table.find_or_claim(KeyHash::from_raw(2), false).unwrap().1);

        for i in 100..105u64 {
            assert!(table.find_or_claim(KeyHash::from_raw(i), true).unwrap().1);
        }
        assert_eq!(table.claimed.load(Ordering::Relaxed), 8);

        table.lift_creation_limit();
        assert!(table.take_creation_budget());
    }

    #[test]
    fn test_creation_burst_on_full_table_keeps_keys() {
        let epoch = Arc::new(LightEpoch::new(SystemState::INITIAL));
        // Grow only when full, so migrations race with a crowded new table
        let index = Arc::new(HashIndex::new(4, 1.0, epoch));
        let threads = 8u64;
        let per_thread = 400u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    let guard = index.epoch.guard().unwrap();
                    for i in 0..per_thread {
                        let key = t * per_thread + i + 1;
                        let hash = KeyHash::of(&key.to_le_bytes());
                        loop {
                            let slot = index.find_or_create_slot(hash, guard.slot()).unwrap();
                            let entry = slot.entry();
                            if !entry.is_migrated()
                                && index.try_update(&slot, entry, Address::new(key * 64), false)
                            {
                                break;
                            }
                        }
                        guard.refresh();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        index.wait_resize_idle();

        let total = threads * per_thread;
        assert_eq!(index.stats().claimed, total);
        for key in 1..=total {
            let hash = KeyHash::of(&key.to_le_bytes());
            let slot = index.find_slot(hash).expect("key lost during resize");
            assert_eq!(slot.entry().address(), Address::new(key * 64));
        }
    }

    #[test]
    fn test_snapshot_restore_and_clear() {
        let index = index(16);
        {
            let guard = index.epoch.guard().unwrap();
            for i in 1..=5u64 {
                let slot = index
                    .find_or_create_slot(KeyHash::from_raw(i), guard.slot())
                    .unwrap();
                assert!(index.try_update(&slot, IndexEntry::EMPTY, Address::new(i * 64), i == 3));
            }
        }
        let snapshot = index.try_snapshot().unwrap();
        assert_eq!(snapshot.entries.len(), 5);

        index.clear();
        assert!(index.find_slot(KeyHash::from_raw(1)).is_none());

        index.restore(&snapshot).unwrap();
        let entry = index.find_slot(KeyHash::from_raw(3)).unwrap().entry();
        assert_eq!(entry.address(), Address::new(192));
        assert!(entry.is_tombstone());
    }
}
