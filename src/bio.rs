//! Buffer cache.
//!
//! A bounded set of sector-sized buffers holding cached copies of disk
//! sectors. Caching reduces device traffic and provides the synchronization
//! point for sectors used by multiple threads.
//!
//! Interface:
//! * `with_read` / `with_write` run a closure against the cached bytes of a
//!   sector, faulting the sector in first if needed.
//! * `read_ahead` queues a best-effort asynchronous fetch.
//! * `flush` writes back every dirty buffer.
//! * `pin` removes a slot from the eviction rotation for good (the free-map
//!   sector lives in a pinned slot).
//!
//! Slot bookkeeping (which sector lives where, dirty/accessed bits, the
//! clock hand) is guarded by one cache-wide mutex. Each slot additionally
//! carries a sleepable lock counting active readers/writers -- its condition
//! variable signals "no readers/writers remain" -- and a reader/writer lock
//! over the bytes themselves. A slot's reader/writer count is drained before
//! any I/O touches its bytes. The bookkeeping mutex is only ever acquired
//! while holding a slot lock, never the other way around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use array_macro::array;
use arrayvec::ArrayVec;
use parking_lot::{Mutex, RwLock};

use crate::dev::{BlockDevice, SectorId};
use crate::lock::{SleepableLock, SleepableLockGuard};
use crate::param::{NSLOT, READ_AHEAD_QUEUE, SECTOR_SIZE, WRITE_BEHIND_INTERVAL_MS};

/// Marks an empty `sector` / `old_sector` field.
const SECTOR_NONE: SectorId = SectorId::MAX;

#[derive(Clone, Copy)]
struct SlotMeta {
    /// Sector this slot maps. While `io_needed` is set, the sector the slot
    /// is being repurposed for.
    sector: SectorId,
    /// Outgoing sector while a repurposing is pending, else `SECTOR_NONE`.
    old_sector: SectorId,
    in_use: bool,
    dirty: bool,
    accessed: bool,
    /// Set between claiming a slot for a new sector and finishing the
    /// write-back/read-in pair. No reads or writes of the slot's bytes are
    /// allowed while set.
    io_needed: bool,
    /// Pinned slots are excluded from the clock rotation.
    pinned: bool,
}

impl SlotMeta {
    const fn empty() -> Self {
        Self {
            sector: SECTOR_NONE,
            old_sector: SECTOR_NONE,
            in_use: false,
            dirty: false,
            accessed: false,
            io_needed: false,
            pinned: false,
        }
    }
}

struct MetaTable {
    slots: [SlotMeta; NSLOT],
    hand: usize,
}

struct BufSlot {
    /// Count of active readers/writers. The condition variable signals that
    /// the count has returned to zero.
    io: SleepableLock<u32>,
    data: RwLock<Box<[u8; SECTOR_SIZE]>>,
}

impl BufSlot {
    fn new() -> Self {
        Self {
            io: SleepableLock::new("buffer", 0),
            data: RwLock::new(Box::new([0u8; SECTOR_SIZE])),
        }
    }
}

pub struct BlockCache {
    dev: Arc<dyn BlockDevice>,
    slots: [BufSlot; NSLOT],
    meta: Mutex<MetaTable>,
    read_ahead: SleepableLock<ArrayVec<SectorId, READ_AHEAD_QUEUE>>,
    /// Write-behind timer; flipping it to true wakes the worker for shutdown.
    stopping: SleepableLock<bool>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            slots: array![_ => BufSlot::new(); NSLOT],
            meta: Mutex::new(MetaTable {
                slots: [SlotMeta::empty(); NSLOT],
                hand: 0,
            }),
            read_ahead: SleepableLock::new("read_ahead", ArrayVec::new()),
            stopping: SleepableLock::new("write_behind", false),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the read-ahead and write-behind workers.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        let cache = Arc::clone(self);
        workers.push(std::thread::spawn(move || cache.read_ahead_loop()));
        let cache = Arc::clone(self);
        workers.push(std::thread::spawn(move || cache.write_behind_loop()));
    }

    /// Flushes everything and joins the workers. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut stopping = self.stopping.lock();
            *stopping = true;
            stopping.wakeup();
        }
        self.read_ahead.lock().wakeup();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        self.flush();
    }

    /// Advances the clock hand to a victim slot: skip pinned slots, clear
    /// accessed bits as the hand passes, land on the first slot that is
    /// neither accessed nor mid-I/O. Returns `None` when a full sweep finds
    /// every candidate mid-I/O.
    fn run_clock(meta: &mut MetaTable) -> Option<usize> {
        for _ in 0..2 * NSLOT {
            meta.hand = (meta.hand + 1) % NSLOT;
            let slot = &mut meta.slots[meta.hand];
            if slot.pinned {
                continue;
            }
            if slot.accessed {
                slot.accessed = false;
            } else if !slot.io_needed {
                return Some(meta.hand);
            }
        }
        None
    }

    /// Ensures `sector` is resident in some slot and returns the slot index
    /// together with its held slot lock. The caller inherits the lock and
    /// must run the reader/writer protocol against it.
    fn acquire(&self, sector: SectorId) -> (usize, SleepableLockGuard<'_, u32>) {
        loop {
            // Find or claim a slot.
            let slot_idx = {
                let mut meta = self.meta.lock();
                let mut empty = None;
                let mut found = None;
                for (i, slot) in meta.slots.iter().enumerate() {
                    if !slot.in_use {
                        if empty.is_none() {
                            empty = Some(i);
                        }
                    } else if slot.sector == sector
                        || (slot.io_needed && slot.old_sector == sector)
                    {
                        // Either the sector is resident (possibly about to be
                        // read in by a racing claim), or its bytes are still
                        // here awaiting write-back. The re-verify below sorts
                        // the two apart.
                        found = Some(i);
                        break;
                    }
                }
                match found.or(empty) {
                    Some(i) if found.is_some() => i,
                    Some(i) => {
                        let slot = &mut meta.slots[i];
                        slot.sector = sector;
                        slot.old_sector = SECTOR_NONE;
                        slot.in_use = true;
                        slot.io_needed = true;
                        i
                    }
                    None => match Self::run_clock(&mut meta) {
                        Some(i) => {
                            let slot = &mut meta.slots[i];
                            slot.old_sector = slot.sector;
                            slot.sector = sector;
                            slot.io_needed = true;
                            i
                        }
                        None => {
                            // Every candidate is mid-I/O; let the claimants
                            // finish and rescan.
                            drop(meta);
                            std::thread::yield_now();
                            continue;
                        }
                    },
                }
            };

            let mut io = self.slots[slot_idx].io.lock();

            // The claim may still be pending, or may have been completed (or
            // re-stolen) by another thread while we waited for the slot lock.
            if self.meta.lock().slots[slot_idx].io_needed {
                while *io > 0 {
                    io.sleep();
                }
                let (old_sector, cur_sector, dirty) = {
                    let meta = self.meta.lock();
                    let slot = &meta.slots[slot_idx];
                    (slot.old_sector, slot.sector, slot.dirty)
                };
                {
                    let mut data = self.slots[slot_idx].data.write();
                    if dirty && old_sector != SECTOR_NONE {
                        self.dev.write(old_sector, &data);
                    }
                    self.dev.read(cur_sector, &mut data);
                }
                let mut meta = self.meta.lock();
                let slot = &mut meta.slots[slot_idx];
                slot.io_needed = false;
                slot.dirty = false;
                slot.accessed = false;
                slot.old_sector = SECTOR_NONE;
            }

            // Re-verify: the slot may have been stolen for another sector in
            // the race window. If so, retry from the top.
            {
                let meta = self.meta.lock();
                let slot = &meta.slots[slot_idx];
                if slot.in_use && slot.sector == sector && !slot.io_needed {
                    return (slot_idx, io);
                }
            }
            drop(io);
        }
    }

    /// Runs `f` against the cached bytes of `sector`, faulting it in first.
    ///
    /// The reader protocol: bump the active count, release the slot lock,
    /// copy outside it, then reacquire, decrement, and broadcast when the
    /// count returns to zero. The split is what lets unrelated slots be
    /// evicted without holding this reader's lock.
    pub fn with_read<R>(&self, sector: SectorId, f: impl FnOnce(&[u8; SECTOR_SIZE]) -> R) -> R {
        let (slot_idx, mut io) = self.acquire(sector);
        *io += 1;
        drop(io);

        let result = {
            let data = self.slots[slot_idx].data.read();
            f(&data)
        };
        self.meta.lock().slots[slot_idx].accessed = true;

        let mut io = self.slots[slot_idx].io.lock();
        *io -= 1;
        if *io == 0 {
            io.wakeup();
        }
        result
    }

    /// Writer counterpart of `with_read`; additionally marks the slot dirty.
    pub fn with_write<R>(
        &self,
        sector: SectorId,
        f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> R,
    ) -> R {
        let (slot_idx, mut io) = self.acquire(sector);
        *io += 1;
        drop(io);

        let result = {
            let mut data = self.slots[slot_idx].data.write();
            f(&mut data)
        };
        {
            let mut meta = self.meta.lock();
            meta.slots[slot_idx].accessed = true;
            meta.slots[slot_idx].dirty = true;
        }

        let mut io = self.slots[slot_idx].io.lock();
        *io -= 1;
        if *io == 0 {
            io.wakeup();
        }
        result
    }

    /// Pins the slot holding `sector` out of the eviction rotation for the
    /// lifetime of the cache.
    pub fn pin(&self, sector: SectorId) {
        let (slot_idx, _io) = self.acquire(sector);
        self.meta.lock().slots[slot_idx].pinned = true;
    }

    /// Best-effort request to fetch `sector` in the background. Dropped
    /// silently when the queue is full.
    pub fn read_ahead(&self, sector: SectorId) {
        let mut queue = self.read_ahead.lock();
        if queue.try_push(sector).is_ok() {
            queue.wakeup();
        }
    }

    fn read_ahead_loop(&self) {
        loop {
            let sector = {
                let mut queue = self.read_ahead.lock();
                loop {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    if !queue.is_empty() {
                        break queue.remove(0);
                    }
                    queue.sleep();
                }
            };
            log::trace!("read-ahead sector {}", sector);
            let (_slot, _io) = self.acquire(sector);
        }
    }

    fn write_behind_loop(&self) {
        loop {
            {
                let mut stopping = self.stopping.lock();
                if *stopping {
                    return;
                }
                stopping.sleep_for(Duration::from_millis(WRITE_BEHIND_INTERVAL_MS));
                if *stopping {
                    return;
                }
            }
            self.flush();
        }
    }

    /// Writes back every dirty buffer, draining in-flight readers/writers
    /// first. While a slot is mid-repurposing the write-back target is its
    /// outgoing sector, not the incoming one.
    pub fn flush(&self) {
        for slot_idx in 0..NSLOT {
            let mut io = self.slots[slot_idx].io.lock();
            while *io > 0 {
                io.sleep();
            }
            let target = {
                let meta = self.meta.lock();
                let slot = &meta.slots[slot_idx];
                if !slot.in_use || !slot.dirty {
                    continue;
                }
                if slot.io_needed {
                    slot.old_sector
                } else {
                    slot.sector
                }
            };
            if target == SECTOR_NONE {
                continue;
            }
            {
                let data = self.slots[slot_idx].data.read();
                self.dev.write(target, &data);
            }
            self.meta.lock().slots[slot_idx].dirty = false;
            log::trace!("write-behind flushed sector {}", target);
        }
    }

    /// Sectors currently resident, for inspection by tests.
    pub fn resident_sectors(&self) -> Vec<SectorId> {
        let meta = self.meta.lock();
        meta.slots
            .iter()
            .filter(|s| s.in_use && !s.io_needed)
            .map(|s| s.sector)
            .collect()
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.stop();
    }
}
