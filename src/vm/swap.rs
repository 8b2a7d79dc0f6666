//! Swap slot allocator.
//!
//! A bitmap over page-sized slots on the swap device. Slot `s` occupies the
//! device sectors `s * 8 .. s * 8 + 8`. Swap traffic bypasses the filesystem
//! cache entirely and goes straight to the device.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dev::{BlockDevice, SectorId};
use crate::param::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

pub type SwapSlot = u32;

pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    bitmap: Mutex<Vec<u8>>,
    slots: u32,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slots = dev.sector_count() / SECTORS_PER_PAGE as u32;
        Self {
            dev,
            bitmap: Mutex::new(vec![0u8; slots.div_ceil(8) as usize]),
            slots,
        }
    }

    fn is_set(bitmap: &[u8], slot: SwapSlot) -> bool {
        bitmap[slot as usize / 8] & (1 << (slot % 8)) != 0
    }

    /// Claims the first free slot. `None` means swap is exhausted, which is
    /// fatal for the pager that triggered the allocation.
    pub fn allocate(&self) -> Option<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        for slot in 0..self.slots {
            if !Self::is_set(&bitmap, slot) {
                bitmap[slot as usize / 8] |= 1 << (slot % 8);
                return Some(slot);
            }
        }
        log::warn!("swap exhausted ({} slots)", self.slots);
        None
    }

    /// Releases `slot`. Releasing a free slot is an invariant violation.
    pub fn free(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        assert!(Self::is_set(&bitmap, slot), "free of unallocated swap slot");
        bitmap[slot as usize / 8] &= !(1 << (slot % 8));
    }

    /// Reads the page stored in `slot` into `dst`.
    pub fn read_page(&self, slot: SwapSlot, dst: &mut [u8; PAGE_SIZE]) {
        assert!(Self::is_set(&self.bitmap.lock(), slot));
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            let sector = slot * SECTORS_PER_PAGE as u32 + i as u32;
            self.dev.read(sector as SectorId, &mut sector_buf);
            dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector_buf);
        }
    }

    /// Writes `src` into `slot`.
    pub fn write_page(&self, slot: SwapSlot, src: &[u8; PAGE_SIZE]) {
        assert!(Self::is_set(&self.bitmap.lock(), slot));
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            let sector = slot * SECTORS_PER_PAGE as u32 + i as u32;
            sector_buf.copy_from_slice(&src[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.dev.write(sector as SectorId, &sector_buf);
        }
    }

    /// Free slots remaining, for inspection by tests.
    pub fn free_slots(&self) -> u32 {
        let bitmap = self.bitmap.lock();
        (0..self.slots)
            .filter(|&slot| !Self::is_set(&bitmap, slot))
            .count() as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dev::MemDisk;

    #[test]
    fn page_roundtrip() {
        let swap = SwapTable::new(Arc::new(MemDisk::new(64)));
        assert_eq!(swap.free_slots(), 8);
        let slot = swap.allocate().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
        swap.write_page(slot, &page);
        let mut out = [0u8; PAGE_SIZE];
        swap.read_page(slot, &mut out);
        assert_eq!(page[..], out[..]);
        swap.free(slot);
        assert_eq!(swap.free_slots(), 8);
    }

    #[test]
    #[should_panic]
    fn double_free_is_fatal() {
        let swap = SwapTable::new(Arc::new(MemDisk::new(64)));
        let slot = swap.allocate().unwrap();
        swap.free(slot);
        swap.free(slot);
    }
}
