//! Per-process page directory.
//!
//! The software analogue of the hardware page table: a map from virtual page
//! to physical frame plus the writable, accessed, and dirty bits the MMU
//! would maintain. Every simulated user access routes through `mark_access`,
//! which is what keeps the accessed/dirty bits honest for the clock and for
//! mmap write-back.

use std::collections::HashMap;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::vm::addr::pg_round_down;

bitflags! {
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

#[derive(Clone, Copy)]
struct Pte {
    frame: usize,
    flags: PteFlags,
}

#[derive(Default)]
pub struct PageDir {
    map: Mutex<HashMap<usize, Pte>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `vpage` to `frame`. Fails when the page is already mapped.
    pub fn set_page(&self, vpage: usize, frame: usize, writable: bool) -> bool {
        let vpage = pg_round_down(vpage);
        let mut map = self.map.lock();
        if map.contains_key(&vpage) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        map.insert(vpage, Pte { frame, flags });
        true
    }

    /// Unmaps `vpage`; the accessed/dirty bits go with it.
    pub fn clear_page(&self, vpage: usize) {
        self.map.lock().remove(&pg_round_down(vpage));
    }

    /// Returns `(frame, writable)` when `vpage` is mapped.
    pub fn lookup(&self, vpage: usize) -> Option<(usize, bool)> {
        self.map
            .lock()
            .get(&pg_round_down(vpage))
            .map(|pte| (pte.frame, pte.flags.contains(PteFlags::WRITABLE)))
    }

    pub fn is_accessed(&self, vpage: usize) -> bool {
        self.map
            .lock()
            .get(&pg_round_down(vpage))
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&self, vpage: usize, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&pg_round_down(vpage)) {
            pte.flags.set(PteFlags::ACCESSED, value);
        }
    }

    pub fn is_dirty(&self, vpage: usize) -> bool {
        self.map
            .lock()
            .get(&pg_round_down(vpage))
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    pub fn set_dirty(&self, vpage: usize, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&pg_round_down(vpage)) {
            pte.flags.set(PteFlags::DIRTY, value);
        }
    }

    /// Records a simulated user-mode access, setting the accessed bit and,
    /// for writes, the dirty bit. Returns the frame, or `None` on a fault.
    pub fn mark_access(&self, vpage: usize, write: bool) -> Option<usize> {
        let mut map = self.map.lock();
        let pte = map.get_mut(&pg_round_down(vpage))?;
        if write && !pte.flags.contains(PteFlags::WRITABLE) {
            return None;
        }
        pte.flags |= PteFlags::ACCESSED;
        if write {
            pte.flags |= PteFlags::DIRTY;
        }
        Some(pte.frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn access_bits_follow_usage() {
        let pd = PageDir::new();
        assert!(pd.set_page(0x1000, 3, true));
        assert!(!pd.set_page(0x1000, 4, true));
        assert!(!pd.is_accessed(0x1000));
        assert_eq!(pd.mark_access(0x1000, false), Some(3));
        assert!(pd.is_accessed(0x1000));
        assert!(!pd.is_dirty(0x1000));
        assert_eq!(pd.mark_access(0x1000, true), Some(3));
        assert!(pd.is_dirty(0x1000));
        pd.clear_page(0x1000);
        assert_eq!(pd.lookup(0x1000), None);
    }

    #[test]
    fn read_only_write_faults() {
        let pd = PageDir::new();
        assert!(pd.set_page(0x2000, 9, false));
        assert_eq!(pd.mark_access(0x2000, true), None);
        assert_eq!(pd.mark_access(0x2000, false), Some(9));
    }
}
