//! Hybrid log
//!
//! An append-only record log addressed by logical address. The newest pages
//! live in a circular pool of in-memory frames; older pages are flushed to
//! the log device and evicted.
//!
//! ```text
//!  begin        head       safe_read_only  read_only          tail
//!    |  on disk   |    read-only   |           |    mutable     |
//!    +------------+----------------+-----------+----------------+
//! ```
//!
//! Moving `read_only` schedules a flush of the newly read-only range once
//! the epoch barrier passes. Moving `head` (never beyond `flushed_until`)
//! schedules eviction of the frames below it. Allocation that needs a frame
//! still occupied by an old page waits, refreshing its epoch, until that
//! page has been flushed and evicted.

pub mod object_log;
pub mod record;

use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::io::IoPool;
use crate::read_cache::ReadCache;
use bytes::Bytes;
use hybridkv_common::{Address, Error, LogConfig, Result};
use object_log::ObjectLog;
use parking_lot::{Mutex, RwLock};
use record::{
    FLAGS_OFFSET, LogRecord, RECORD_HEADER_SIZE, RecordHeader, RecordValue, decode_record,
    encode_object_ref, encode_record, flags,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Frame page id meaning "no page loaded"
const FREE_FRAME: u64 = u64::MAX;

struct PageFrame {
    page: AtomicU64,
    data: RwLock<Box<[u8]>>,
}

/// Outcome of a synchronous record lookup
#[derive(Debug)]
pub enum RecordRead {
    /// Decoded from memory or the read cache
    Found(LogRecord),
    /// Below the head; needs a device read
    OnDisk,
    /// Below the begin address; logically truncated
    BelowBegin,
}

/// Log statistics and address markers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub begin_address: Address,
    pub head_address: Address,
    pub safe_read_only_address: Address,
    pub read_only_address: Address,
    pub tail_address: Address,
    pub flushed_until_address: Address,
    pub pages_allocated: u64,
    pub bytes_flushed: u64,
    pub pages_evicted: u64,
    pub disk_reads: u64,
    pub object_log_bytes: u64,
    pub read_cache_hits: u64,
    pub read_cache_misses: u64,
}

#[derive(Default)]
struct Counters {
    pages_allocated: AtomicU64,
    bytes_flushed: AtomicU64,
    pages_evicted: AtomicU64,
    disk_reads: AtomicU64,
}

/// The hybrid log
pub struct HybridLog {
    page_bits: u32,
    page_size: u64,
    buffer_pages: u64,
    mutable_pages: u64,
    object_threshold: usize,

    epoch: Arc<LightEpoch>,
    device: Arc<dyn StorageDevice>,
    objects: ObjectLog,
    io: IoPool,
    read_cache: Option<ReadCache>,

    frames: Box<[PageFrame]>,
    begin: AtomicU64,
    head: AtomicU64,
    safe_head: AtomicU64,
    safe_read_only: AtomicU64,
    read_only: AtomicU64,
    tail: AtomicU64,
    flushed_until: AtomicU64,

    flush_completions: Mutex<BTreeMap<u64, u64>>,
    flush_error: Mutex<Option<String>>,
    roll_lock: Mutex<()>,
    counters: Counters,
    self_ref: Weak<Self>,
}

impl HybridLog {
    /// Create a log over the given devices
    ///
    /// Appends start at the first page boundary past any existing device
    /// contents, so earlier data stays available to recovery.
    pub fn new(
        config: &LogConfig,
        epoch: Arc<LightEpoch>,
        device: Arc<dyn StorageDevice>,
        object_device: Arc<dyn StorageDevice>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let page_bits = config.page_bits;
        let page_size = config.page_size();
        let buffer_pages = config.buffer_pages();

        let existing = device.len()?;
        let start = if existing <= Address::FIRST_VALID.raw() {
            Address::FIRST_VALID.raw()
        } else {
            existing.div_ceil(page_size) * page_size
        };
        let objects = ObjectLog::new(object_device)?;
        let read_cache = config
            .read_cache_enabled
            .then(|| ReadCache::new(config.read_cache_capacity));

        let log = Arc::new_cyclic(|self_ref| Self {
            page_bits,
            page_size,
            buffer_pages,
            mutable_pages: config.mutable_pages(),
            object_threshold: config.effective_object_log_threshold(),
            epoch,
            device,
            objects,
            io: IoPool::new(config.io_threads),
            read_cache,
            frames: (0..buffer_pages)
                .map(|_| PageFrame {
                    page: AtomicU64::new(FREE_FRAME),
                    data: RwLock::new(vec![0u8; page_size as usize].into_boxed_slice()),
                })
                .collect(),
            begin: AtomicU64::new(start),
            head: AtomicU64::new(start),
            safe_head: AtomicU64::new(start),
            safe_read_only: AtomicU64::new(start),
            read_only: AtomicU64::new(start),
            tail: AtomicU64::new(start),
            flushed_until: AtomicU64::new(start),
            flush_completions: Mutex::new(BTreeMap::new()),
            flush_error: Mutex::new(None),
            roll_lock: Mutex::new(()),
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        });
        log.install_page(start >> page_bits);

        info!(
            "Hybrid log on {} starting at {:#x} ({} pages of {} bytes in memory)",
            log.device.name(),
            start,
            buffer_pages,
            page_size
        );
        Ok(log)
    }

    fn frame(&self, page: u64) -> &PageFrame {
        &self.frames[(page % self.buffer_pages) as usize]
    }

    const fn page_start(&self, page: u64) -> u64 {
        page << self.page_bits
    }

    fn install_page(&self, page: u64) {
        let frame = self.frame(page);
        frame.data.write().fill(0);
        frame.page.store(page, Ordering::SeqCst);
        self.counters.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Page size in bytes
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The epoch table this log is protected by
    pub fn epoch(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    pub fn begin_address(&self) -> Address {
        Address::new(self.begin.load(Ordering::SeqCst))
    }

    pub fn head_address(&self) -> Address {
        Address::new(self.head.load(Ordering::SeqCst))
    }

    pub fn safe_read_only_address(&self) -> Address {
        Address::new(self.safe_read_only.load(Ordering::SeqCst))
    }

    pub fn read_only_address(&self) -> Address {
        Address::new(self.read_only.load(Ordering::SeqCst))
    }

    pub fn tail_address(&self) -> Address {
        Address::new(self.tail.load(Ordering::SeqCst))
    }

    pub fn flushed_until_address(&self) -> Address {
        Address::new(self.flushed_until.load(Ordering::SeqCst))
    }

    /// Object log tail offset
    pub fn object_log_tail(&self) -> u64 {
        self.objects.tail()
    }

    /// Fail if a background flush has failed
    pub fn check_flush_error(&self) -> Result<()> {
        match self.flush_error.lock().as_ref() {
            Some(reason) => Err(Error::device(format!("log flush failed: {reason}"))),
            None => Ok(()),
        }
    }

    /// Reserve `size` bytes at the tail
    ///
    /// `slot` must be protected by the caller.
    pub fn allocate(&self, size: usize, slot: usize) -> Result<Address> {
        let size = size as u64;
        if size >= self.page_size - Address::FIRST_VALID.raw() {
            return Err(Error::RecordTooLarge {
                size: size as usize,
                page_size: self.page_size as usize,
            });
        }

        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let offset = tail & (self.page_size - 1);
            if offset + size < self.page_size {
                if self
                    .tail
                    .compare_exchange(tail, tail + size, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(Address::new(tail));
                }
                continue;
            }

            if let Some(address) = self.try_roll(tail >> self.page_bits, size, slot)? {
                return Ok(address);
            }
            self.epoch.refresh(slot);
            thread::yield_now();
        }
    }

    /// Move the tail to page `page + 1` and allocate `size` bytes there.
    /// `None` when another thread is rolling or already rolled.
    fn try_roll(&self, page: u64, size: u64, slot: usize) -> Result<Option<Address>> {
        let Some(_roll) = self.roll_lock.try_lock() else {
            return Ok(None);
        };
        if self.tail.load(Ordering::SeqCst) >> self.page_bits != page {
            return Ok(None);
        }

        let next = page + 1;
        let next_start = self.page_start(next);
        if next_start + self.page_size > Address::MAX.raw() {
            return Err(Error::AddressSpaceExhausted);
        }

        // Keep `mutable_pages` pages (including the new one) mutable
        let read_only_target = self.page_start((next + 1).saturating_sub(self.mutable_pages));
        self.shift_read_only_address(Address::new(read_only_target));

        // The frame for `next` still holds page `next - buffer_pages`
        let head_target = self.page_start((next + 1).saturating_sub(self.buffer_pages));
        let frame = self.frame(next);
        let mut waits = 0u64;
        loop {
            let occupant = frame.page.load(Ordering::SeqCst);
            if occupant == FREE_FRAME || occupant == next {
                break;
            }
            self.check_flush_error()?;
            let bounded = head_target.min(self.flushed_until.load(Ordering::SeqCst));
            self.shift_head_address(Address::new(bounded));
            self.epoch.refresh(slot);
            waits += 1;
            if waits % 1024 == 0 {
                debug!(
                    "Waiting for frame of page {} (flushed until {:#x}, head target {:#x})",
                    next,
                    self.flushed_until.load(Ordering::SeqCst),
                    head_target
                );
                thread::sleep(Duration::from_micros(100));
            } else {
                thread::yield_now();
            }
        }

        self.install_page(next);
        self.tail.store(next_start + size, Ordering::SeqCst);
        Ok(Some(Address::new(next_start)))
    }

    /// Append a record for already-encoded key and value bytes
    ///
    /// Large values go to the object log first.
    pub fn append(
        &self,
        key: &[u8],
        value: &[u8],
        prev: Address,
        version: u32,
        tombstone: bool,
        slot: usize,
    ) -> Result<Address> {
        let mut record_flags = if tombstone { flags::TOMBSTONE } else { 0 };
        let reference;
        let value_area = if !tombstone && value.len() > self.object_threshold {
            let offset = self.objects.append(value)?;
            reference = encode_object_ref(offset, value.len() as u64);
            record_flags |= flags::OBJECT;
            &reference[..]
        } else {
            value
        };

        let bytes = encode_record(prev, version, record_flags, key, value_area);
        let address = self.allocate(bytes.len(), slot)?;
        self.write_at(address, &bytes)?;
        Ok(address)
    }

    fn write_at(&self, address: Address, bytes: &[u8]) -> Result<()> {
        let page = address.page(self.page_bits);
        let offset = address.offset(self.page_bits) as usize;
        let frame = self.frame(page);
        let mut data = frame.data.write();
        if frame.page.load(Ordering::SeqCst) != page {
            return Err(Error::internal(format!(
                "page {page} evicted while writing {address}"
            )));
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Mark a record that lost its index CAS as invalid
    pub fn mark_invalid(&self, address: Address) {
        if address < self.head_address() {
            return;
        }
        let page = address.page(self.page_bits);
        let offset = address.offset(self.page_bits) as usize;
        let frame = self.frame(page);
        let mut data = frame.data.write();
        if frame.page.load(Ordering::SeqCst) == page {
            data[offset + FLAGS_OFFSET] |= flags::INVALID;
        }
    }

    /// Read a record without blocking on I/O
    ///
    /// The caller must hold a protected epoch slot.
    pub fn read(&self, address: Address) -> Result<RecordRead> {
        if address < self.begin_address() || address.is_invalid() {
            return Ok(RecordRead::BelowBegin);
        }
        if address >= self.head_address() {
            if let Some(record) = self.read_from_memory(address)? {
                return Ok(RecordRead::Found(record));
            }
        }
        if let Some(cache) = &self.read_cache {
            if let Some(image) = cache.get(address) {
                return decode_record(address, &image, false).map(RecordRead::Found);
            }
        }
        Ok(RecordRead::OnDisk)
    }

    fn read_from_memory(&self, address: Address) -> Result<Option<LogRecord>> {
        let page = address.page(self.page_bits);
        let offset = address.offset(self.page_bits) as usize;
        let frame = self.frame(page);
        let data = frame.data.read();
        if frame.page.load(Ordering::SeqCst) != page {
            return Ok(None);
        }
        let Some(header) = RecordHeader::decode(&data[offset..]) else {
            return Err(Error::internal(format!("no record at {address}")));
        };
        let end = (offset + header.size()).min(data.len());
        decode_record(address, &data[offset..end], false).map(Some)
    }

    /// Fetch a record from the device on the I/O pool
    ///
    /// The completion runs on an I/O thread.
    pub fn read_async(
        &self,
        address: Address,
        completion: impl FnOnce(Result<LogRecord>) + Send + 'static,
    ) {
        self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        let log = self.self_ref.clone();
        self.io.submit(move || {
            let result = match log.upgrade() {
                Some(log) => log.read_from_device(address),
                None => Err(Error::invalid_state("log closed")),
            };
            completion(result);
        });
    }

    /// Blocking device read of one record, filling the read cache
    pub fn read_from_device(&self, address: Address) -> Result<LogRecord> {
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        self.device.read_at(address.raw(), &mut header_buf)?;
        let header = RecordHeader::decode(&header_buf).ok_or_else(|| {
            Error::Deserialization(format!(
                "no record at {address} on {}",
                self.device.name()
            ))
        })?;
        // Records never span pages; a larger size is a damaged header
        if header.size() as u64 > self.page_size {
            return Err(Error::Deserialization(format!(
                "record at {address} claims {} bytes, more than a {} byte page",
                header.size(),
                self.page_size
            )));
        }

        let mut image = vec![0u8; header.size()];
        self.device.read_at(address.raw(), &mut image)?;
        let record = decode_record(address, &image, true)?;
        if let Some(cache) = &self.read_cache {
            cache.insert(address, Bytes::from(image));
        }
        Ok(record)
    }

    /// Header of a record on the device
    pub fn read_header_from_device(&self, address: Address) -> Result<Option<RecordHeader>> {
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        self.device.read_at(address.raw(), &mut header_buf)?;
        Ok(RecordHeader::decode(&header_buf))
    }

    /// Resolve a record's value bytes, reading the object log if needed
    pub fn load_value(&self, record: &LogRecord) -> Result<Bytes> {
        match &record.value {
            RecordValue::Inline(bytes) => Ok(bytes.clone()),
            RecordValue::Object { offset, len } => self.objects.read(*offset, *len),
        }
    }

    /// Make `[read_only, new)` read-only and schedule its flush
    pub fn shift_read_only_address(&self, new: Address) {
        let new = new.raw().min(self.tail.load(Ordering::SeqCst));
        let mut old = self.read_only.load(Ordering::SeqCst);
        loop {
            if new <= old {
                return;
            }
            match self
                .read_only
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }

        let log = self.self_ref.clone();
        self.epoch.bump_with_action(move || {
            if let Some(log) = log.upgrade() {
                log.safe_read_only.fetch_max(new, Ordering::SeqCst);
                log.issue_flush(old, new);
            }
        });
    }

    fn issue_flush(&self, from: u64, to: u64) {
        let mut start = from;
        while start < to {
            let page = start >> self.page_bits;
            let end = to.min(self.page_start(page + 1));
            let offset = (start & (self.page_size - 1)) as usize;
            let len = (end - start) as usize;

            let frame = self.frame(page);
            let bytes = {
                let data = frame.data.read();
                if frame.page.load(Ordering::SeqCst) == page {
                    Some(data[offset..offset + len].to_vec())
                } else {
                    None
                }
            };
            let Some(bytes) = bytes else {
                error!("Page {} left memory before it was flushed", page);
                self.record_flush_error(format!("page {page} missing from memory"));
                return;
            };

            let device = Arc::clone(&self.device);
            let log = self.self_ref.clone();
            let (range_start, range_end) = (start, end);
            self.io.submit(move || {
                let result = device.write_at(range_start, &bytes);
                if let Some(log) = log.upgrade() {
                    log.complete_flush(range_start, range_end, result);
                }
            });
            start = end;
        }
    }

    fn record_flush_error(&self, reason: String) {
        let mut slot = self.flush_error.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn complete_flush(&self, from: u64, to: u64, result: Result<()>) {
        if let Err(e) = result {
            warn!("Flush of [{:#x}, {:#x}) failed: {}", from, to, e);
            self.record_flush_error(e.to_string());
            return;
        }
        self.counters
            .bytes_flushed
            .fetch_add(to - from, Ordering::Relaxed);

        let mut completions = self.flush_completions.lock();
        completions.insert(from, to);
        let mut flushed = self.flushed_until.load(Ordering::SeqCst);
        while let Some(end) = completions.remove(&flushed) {
            flushed = end;
        }
        self.flushed_until.store(flushed, Ordering::SeqCst);
    }

    /// Move the head (bounded by `flushed_until`) and schedule eviction of
    /// the frames below it
    pub fn shift_head_address(&self, new: Address) {
        let new = new.raw().min(self.flushed_until.load(Ordering::SeqCst));
        let mut old = self.head.load(Ordering::SeqCst);
        loop {
            if new <= old {
                return;
            }
            match self
                .head
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }

        let log = self.self_ref.clone();
        self.epoch.bump_with_action(move || {
            if let Some(log) = log.upgrade() {
                log.evict(old, new);
            }
        });
    }

    fn evict(&self, old: u64, new: u64) {
        for page in (old >> self.page_bits)..(new >> self.page_bits) {
            let frame = self.frame(page);
            if frame
                .page
                .compare_exchange(page, FREE_FRAME, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.counters.pages_evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.safe_head.fetch_max(new, Ordering::SeqCst);
        debug!("Evicted log below {:#x}", new);
    }

    /// Make the whole log read-only and flush it
    ///
    /// With `wait`, returns once everything below the current tail is on
    /// the device and synced. `slot` must be protected.
    pub fn flush(&self, wait: bool, slot: usize) -> Result<Address> {
        let target = self.tail.load(Ordering::SeqCst);
        self.shift_read_only_address(Address::new(target));
        if wait {
            self.wait_flushed(Address::new(target), slot)?;
            self.device.sync()?;
            self.objects.sync()?;
        }
        Ok(Address::new(target))
    }

    /// Wait until everything below `until` is flushed
    pub fn wait_flushed(&self, until: Address, slot: usize) -> Result<()> {
        while self.flushed_until.load(Ordering::SeqCst) < until.raw() {
            self.check_flush_error()?;
            self.epoch.refresh(slot);
            thread::sleep(Duration::from_micros(50));
        }
        Ok(())
    }

    /// Flush the whole log and evict it from memory
    ///
    /// Later reads of the evicted range go to the device.
    pub fn flush_and_evict(&self, wait: bool, slot: usize) -> Result<()> {
        let target = self.flush(wait, slot)?;
        self.shift_head_address(target);
        if wait {
            while self.safe_head.load(Ordering::SeqCst) < target.raw() {
                self.epoch.refresh(slot);
                thread::yield_now();
            }
            debug!("Flushed and evicted log up to {}", target);
        }
        Ok(())
    }

    /// Logically truncate the log below `address`
    pub fn shift_begin_address(&self, address: Address) -> Address {
        let target = address.raw().min(self.tail.load(Ordering::SeqCst));
        let previous = self.begin.fetch_max(target, Ordering::SeqCst);
        if target > previous {
            self.shift_read_only_address(Address::new(target));
            self.shift_head_address(Address::new(target));
            info!("Shifted log begin address to {:#x}", target);
        }
        self.begin_address()
    }

    /// Copy the raw bytes of `[from, to)` from memory or the device
    pub fn copy_range(&self, from: Address, to: Address) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(to.raw().saturating_sub(from.raw()) as usize);
        let mut start = from.raw();
        while start < to.raw() {
            let page = start >> self.page_bits;
            let end = to.raw().min(self.page_start(page + 1));
            let offset = (start & (self.page_size - 1)) as usize;
            let len = (end - start) as usize;

            let copied = {
                let frame = self.frame(page);
                let data = frame.data.read();
                (frame.page.load(Ordering::SeqCst) == page).then(|| {
                    out.extend_from_slice(&data[offset..offset + len]);
                })
            };
            if copied.is_none() {
                let mut buf = vec![0u8; len];
                self.device.read_at(start, &mut buf)?;
                out.extend_from_slice(&buf);
            }
            start = end;
        }
        Ok(out)
    }

    /// Sync the log and object log devices
    pub fn sync_devices(&self) -> Result<()> {
        self.device.sync()?;
        self.objects.sync()
    }

    /// Write a snapshot image back to the device at `at`
    pub fn write_image(&self, at: Address, image: &[u8]) -> Result<()> {
        self.device.write_at(at.raw(), image)
    }

    /// Bytes held by the log device
    pub fn device_len(&self) -> Result<u64> {
        self.device.len()
    }

    /// Truncate the log device to `len`
    pub fn truncate_device(&self, len: Address) -> Result<()> {
        self.device.truncate(len.raw())
    }

    /// Roll the object log back to `tail`
    pub fn restore_object_log(&self, tail: u64) -> Result<()> {
        self.objects.restore_tail(tail)
    }

    /// Set the invalid flag on every record in `[from, to)` on the device
    /// whose version is newer than `version`. Returns how many were marked.
    pub fn invalidate_newer(&self, from: Address, to: Address, version: u32) -> Result<u64> {
        let mut marked = 0u64;
        let mut page = from.page(self.page_bits);
        let mut offset = from.offset(self.page_bits) as usize;
        let mut buf = vec![0u8; self.page_size as usize];

        while self.page_start(page) < to.raw() {
            let page_start = self.page_start(page);
            let limit = (to.raw() - page_start).min(self.page_size) as usize;
            self.device.read_at(page_start, &mut buf[..limit])?;

            while offset + RECORD_HEADER_SIZE <= limit {
                let Some(header) = RecordHeader::decode(&buf[offset..limit]) else {
                    break;
                };
                if header.version > version && !header.is_invalid() {
                    let flag = [header.flags | flags::INVALID];
                    self.device
                        .write_at(page_start + (offset + FLAGS_OFFSET) as u64, &flag)?;
                    marked += 1;
                }
                offset += header.size();
            }
            page += 1;
            offset = 0;
        }
        Ok(marked)
    }

    /// Reset all markers for a recovered log ending at `tail`
    ///
    /// Loads the page containing `tail` from the device so appends continue
    /// where the recovered log ends. No thread may be using the log.
    pub fn reset_to(&self, begin: Address, tail: Address) -> Result<()> {
        for frame in self.frames.iter() {
            frame.page.store(FREE_FRAME, Ordering::SeqCst);
        }
        self.flush_completions.lock().clear();
        *self.flush_error.lock() = None;

        let tail_page = tail.page(self.page_bits);
        let page_start = self.page_start(tail_page);
        {
            let frame = self.frame(tail_page);
            let mut data = frame.data.write();
            data.fill(0);
            let len = (tail.raw() - page_start) as usize;
            self.device.read_at(page_start, &mut data[..len])?;
            frame.page.store(tail_page, Ordering::SeqCst);
        }

        let head = page_start.max(begin.raw());
        self.begin.store(begin.raw(), Ordering::SeqCst);
        self.head.store(head, Ordering::SeqCst);
        self.safe_head.store(head, Ordering::SeqCst);
        self.read_only.store(tail.raw(), Ordering::SeqCst);
        self.safe_read_only.store(tail.raw(), Ordering::SeqCst);
        self.flushed_until.store(tail.raw(), Ordering::SeqCst);
        self.tail.store(tail.raw(), Ordering::SeqCst);

        if let Some(cache) = &self.read_cache {
            cache.clear();
        }
        info!(
            "Log reset: begin {}, head {:#x}, tail {}",
            begin, head, tail
        );
        Ok(())
    }

    /// Wait until no flush is queued on the I/O pool
    pub fn drain_io(&self) {
        while self.io.in_flight() > 0 {
            thread::sleep(Duration::from_micros(100));
        }
    }

    /// Get statistics
    pub fn stats(&self) -> LogStats {
        let (hits, misses) = self.read_cache.as_ref().map_or((0, 0), |c| {
            (
                c.stats().hits.load(Ordering::Relaxed),
                c.stats().misses.load(Ordering::Relaxed),
            )
        });
        LogStats {
            begin_address: self.begin_address(),
            head_address: self.head_address(),
            safe_read_only_address: self.safe_read_only_address(),
            read_only_address: self.read_only_address(),
            tail_address: self.tail_address(),
            flushed_until_address: self.flushed_until_address(),
            pages_allocated: self.counters.pages_allocated.load(Ordering::Relaxed),
            bytes_flushed: self.counters.bytes_flushed.load(Ordering::Relaxed),
            pages_evicted: self.counters.pages_evicted.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            object_log_bytes: self.objects.tail(),
            read_cache_hits: hits,
            read_cache_misses: misses,
        }
    }
}

impl Drop for HybridLog {
    fn drop(&mut self) {
        self.io.shutdown();
        if let Err(e) = self.device.sync() {
            warn!("Failed to sync log device on close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::epoch::SystemState;

    fn small_config() -> LogConfig {
        LogConfig {
            memory_bits: 14, // 4 pages
            page_bits: 12,
            io_threads: 2,
            ..Default::default()
        }
    }

    fn open(config: &LogConfig) -> (Arc<HybridLog>, Arc<MemoryDevice>) {
        let device = Arc::new(MemoryDevice::new("hlog"));
        let epoch = Arc::new(LightEpoch::new(SystemState::INITIAL));
        let log = HybridLog::new(
            config,
            epoch,
            Arc::clone(&device) as Arc<dyn StorageDevice>,
            Arc::new(MemoryDevice::new("obj")),
        )
        .unwrap();
        (log, device)
    }

    fn found(read: RecordRead) -> LogRecord {
        match read {
            RecordRead::Found(record) => record,
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_append_and_read_in_memory() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();

        let a = log.append(b"k1", b"v1", Address::INVALID, 1, false, guard.slot()).unwrap();
        let b = log.append(b"k1", b"v2", a, 1, false, guard.slot()).unwrap();
        assert_eq!(a, Address::FIRST_VALID);
        assert!(b > a);

        let record = found(log.read(b).unwrap());
        assert_eq!(record.prev(), a);
        assert_eq!(log.load_value(&record).unwrap(), Bytes::from_static(b"v2"));
    }

    #[test]
    fn test_record_too_large() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        assert!(matches!(
            log.allocate(4096, guard.slot()),
            Err(Error::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_page_roll_flushes_and_evicts() {
        let (log, device) = open(&small_config());
        let guard = log.epoch().guard().unwrap();

        let mut addresses = Vec::new();
        let value = vec![7u8; 200];
        for i in 0..200u32 {
            let key = i.to_le_bytes();
            addresses.push(log.append(&key, &value, Address::INVALID, 1, false, guard.slot()).unwrap());
            guard.refresh();
        }
        log.flush(true, guard.slot()).unwrap();

        let stats = log.stats();
        assert!(stats.tail_address.page(12) >= 10);
        assert!(stats.head_address > Address::FIRST_VALID);
        assert!(stats.pages_evicted > 0);
        assert!(stats.begin_address <= stats.head_address);
        assert!(stats.head_address <= stats.read_only_address);
        assert!(stats.flushed_until_address >= stats.read_only_address);
        assert!(device.len().unwrap() >= stats.flushed_until_address.raw());

        // The first record now lives only on disk
        assert!(matches!(log.read(addresses[0]).unwrap(), RecordRead::OnDisk));
        let record = log.read_from_device(addresses[0]).unwrap();
        assert_eq!(&record.key[..], &0u32.to_le_bytes());

        // And is served from the read cache afterwards
        let cached = found(log.read(addresses[0]).unwrap());
        assert_eq!(cached.address, addresses[0]);
    }

    #[test]
    fn test_damaged_header_length_is_rejected() {
        let (log, device) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        let address = log
            .append(b"key", b"value", Address::INVALID, 1, false, guard.slot())
            .unwrap();
        log.flush_and_evict(true, guard.slot()).unwrap();

        // key_len sits at bytes 16..20 of the header
        device
            .write_at(address.raw() + 16, &(u32::MAX / 2).to_le_bytes())
            .unwrap();
        assert!(matches!(
            log.read_from_device(address),
            Err(Error::Deserialization(_))
        ));
    }

    #[test]
    fn test_async_read() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        let address = log
            .append(b"key", b"value", Address::INVALID, 1, false, guard.slot())
            .unwrap();
        log.flush_and_evict(true, guard.slot()).unwrap();
        assert!(matches!(log.read(address).unwrap(), RecordRead::OnDisk));

        let (tx, rx) = crossbeam_channel::bounded(1);
        log.read_async(address, move |result| tx.send(result).unwrap());
        let record = rx.recv().unwrap().unwrap();
        assert_eq!(&record.key[..], b"key");
    }

    #[test]
    fn test_large_values_use_object_log() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        let big = vec![9u8; 3000];
        let address = log
            .append(b"big", &big, Address::INVALID, 1, false, guard.slot())
            .unwrap();

        let record = found(log.read(address).unwrap());
        assert!(record.header.is_object());
        assert_eq!(log.load_value(&record).unwrap().len(), 3000);
        assert_eq!(log.stats().object_log_bytes, 3000);
    }

    #[test]
    fn test_begin_address_truncation() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        let a = log.append(b"a", b"1", Address::INVALID, 1, false, guard.slot()).unwrap();
        let b = log.append(b"b", b"2", Address::INVALID, 1, false, guard.slot()).unwrap();

        log.shift_begin_address(b);
        assert!(matches!(log.read(a).unwrap(), RecordRead::BelowBegin));
        assert!(!matches!(log.read(b).unwrap(), RecordRead::BelowBegin));
    }

    #[test]
    fn test_invalidate_and_reset() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        let old = log.append(b"a", b"1", Address::INVALID, 1, false, guard.slot()).unwrap();
        let newer = log.append(b"a", b"2", old, 2, false, guard.slot()).unwrap();
        let end = log.flush(true, guard.slot()).unwrap();
        drop(guard);

        assert_eq!(log.invalidate_newer(old, end, 1).unwrap(), 1);
        log.reset_to(Address::FIRST_VALID, end).unwrap();

        let guard = log.epoch().guard().unwrap();
        assert!(found(log.read(newer).unwrap()).is_invalid());
        assert!(!found(log.read(old).unwrap()).is_invalid());

        // Appends continue after the recovered tail
        let next = log.append(b"c", b"3", Address::INVALID, 2, false, guard.slot()).unwrap();
        assert_eq!(next, end);
    }

    #[test]
    fn test_copy_range_spans_memory_and_disk() {
        let (log, _) = open(&small_config());
        let guard = log.epoch().guard().unwrap();
        let first = log.append(b"a", b"1", Address::INVALID, 1, false, guard.slot()).unwrap();
        log.flush_and_evict(true, guard.slot()).unwrap();
        let second = log.append(b"b", b"2", Address::INVALID, 1, false, guard.slot()).unwrap();
        let end = log.tail_address();

        let image = log.copy_range(first, end).unwrap();
        assert_eq!(image.len() as u64, end.raw() - first.raw());
        let offset = (second.raw() - first.raw()) as usize;
        let record = decode_record(second, &image[offset..], true).unwrap();
        assert_eq!(&record.key[..], b"b");
    }

    #[test]
    fn test_reopen_starts_past_existing_data() {
        let config = small_config();
        let device = Arc::new(MemoryDevice::new("hlog"));
        device.write_at(0, &[1u8; 5000]).unwrap();
        let epoch = Arc::new(LightEpoch::new(SystemState::INITIAL));
        let log = HybridLog::new(
            &config,
            epoch,
            device as Arc<dyn StorageDevice>,
            Arc::new(MemoryDevice::new("obj")),
        )
        .unwrap();
        assert_eq!(log.tail_address(), Address::new(8192));
    }
}
