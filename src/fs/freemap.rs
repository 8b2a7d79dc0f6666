//! Free-sector map.
//!
//! A persistent bitmap of the data sectors on the filesystem device, stored
//! at a fixed sector and held in memory through a pinned cache slot for the
//! device's lifetime. Modifications reach the disk only via write-behind or
//! an explicit flush.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bio::BlockCache;
use crate::dev::SectorId;
use crate::error::{KernelError, Result};
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SECTOR_SIZE};

/// Sectors representable by the single-sector bitmap.
const MAP_BITS: u32 = (SECTOR_SIZE * 8) as u32;

pub struct FreeMap {
    cache: Arc<BlockCache>,
    lock: Mutex<()>,
}

fn bit_get(map: &[u8; SECTOR_SIZE], bit: u32) -> bool {
    map[bit as usize / 8] & (1 << (bit % 8)) != 0
}

fn bit_set(map: &mut [u8; SECTOR_SIZE], bit: u32) {
    map[bit as usize / 8] |= 1 << (bit % 8);
}

fn bit_clear(map: &mut [u8; SECTOR_SIZE], bit: u32) {
    map[bit as usize / 8] &= !(1 << (bit % 8));
}

impl FreeMap {
    /// Opens the free map, pinning its cache slot out of the eviction
    /// rotation.
    pub fn open(cache: Arc<BlockCache>) -> Self {
        cache.pin(FREE_MAP_SECTOR);
        Self {
            cache,
            lock: Mutex::new(()),
        }
    }

    /// Builds a fresh map for a device of `sectors` sectors: everything free
    /// except the map itself, the root directory inode, and the range beyond
    /// the end of the device.
    pub fn format(&self, sectors: u32) {
        assert!(sectors <= MAP_BITS, "device too large for the free map");
        let _guard = self.lock.lock();
        self.cache.with_write(FREE_MAP_SECTOR, |map| {
            map.fill(0);
            bit_set(map, FREE_MAP_SECTOR);
            bit_set(map, ROOT_DIR_SECTOR);
            for bit in sectors..MAP_BITS {
                bit_set(map, bit);
            }
        });
    }

    /// Finds `cnt` contiguous free sectors, marks them used, and returns the
    /// first index.
    pub fn allocate(&self, cnt: u32) -> Result<SectorId> {
        assert!(cnt > 0);
        let _guard = self.lock.lock();
        let first = self.cache.with_write(FREE_MAP_SECTOR, |map| {
            let mut run = 0;
            for bit in 0..MAP_BITS {
                if bit_get(map, bit) {
                    run = 0;
                } else {
                    run += 1;
                    if run == cnt {
                        let first = bit + 1 - cnt;
                        for b in first..=bit {
                            bit_set(map, b);
                        }
                        return Some(first);
                    }
                }
            }
            None
        });
        match first {
            Some(first) => Ok(first),
            None => {
                log::debug!("free map exhausted allocating {} sectors", cnt);
                Err(KernelError::NoSpace)
            }
        }
    }

    /// Marks `cnt` sectors starting at `first` free again. Freeing a sector
    /// that is not allocated is an invariant violation.
    pub fn release(&self, first: SectorId, cnt: u32) {
        let _guard = self.lock.lock();
        self.cache.with_write(FREE_MAP_SECTOR, |map| {
            for bit in first..first + cnt {
                assert!(bit_get(map, bit), "double free of sector {}", bit);
                bit_clear(map, bit);
            }
        });
    }

    /// Number of free sectors left, for inspection by tests.
    pub fn free_count(&self) -> u32 {
        let _guard = self.lock.lock();
        self.cache.with_read(FREE_MAP_SECTOR, |map| {
            (0..MAP_BITS).filter(|&bit| !bit_get(map, bit)).count() as u32
        })
    }
}
