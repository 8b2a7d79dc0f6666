//! Frame table and eviction.
//!
//! Owns the pool of physical frames available for user pages and the global
//! table recording which supplemental page occupies each frame. When the
//! pool runs dry a clock sweep picks a victim -- skipping pinned pages and
//! clearing accessed bits as it goes -- and the victim is paged out
//! according to its type: anonymous pages move to swap, dirty mmap pages are
//! written back to their file, and shared read-only executable frames are
//! torn out of every sharer's page directory at once.
//!
//! Lock discipline realized here: a page's `busy` lock is taken before the
//! frame-table state or sharing-table locks, never after; the eviction path
//! takes `busy` only after removing the victim from the table; and `paddr`
//! locks are leaves (nothing else is acquired while one is held). Kernel
//! accesses to a frame (syscall copies into pinned buffers) are recorded in
//! per-frame alias bits, which the clock and the dirty checks OR with the
//! page-directory bits.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{KernelError, Result};
use crate::param::PAGE_SIZE;
use crate::vm::page::{Page, PageSource};
use crate::vm::sharing::SharingTable;
use crate::vm::swap::SwapTable;

struct FrameState {
    owner: Vec<Option<Arc<Page>>>,
    free: Vec<usize>,
    hand: usize,
    /// Kernel-alias accessed/dirty bits, set by syscall-path copies.
    k_accessed: Vec<bool>,
    k_dirty: Vec<bool>,
}

pub struct FrameTable {
    data: Vec<RwLock<Box<[u8; PAGE_SIZE]>>>,
    state: Mutex<FrameState>,
    swap: Arc<SwapTable>,
    sharing: Arc<SharingTable>,
}

impl FrameTable {
    pub fn new(frames: usize, swap: Arc<SwapTable>, sharing: Arc<SharingTable>) -> Self {
        Self {
            data: (0..frames)
                .map(|_| RwLock::new(Box::new([0u8; PAGE_SIZE])))
                .collect(),
            state: Mutex::new(FrameState {
                owner: vec![None; frames],
                free: (0..frames).rev().collect(),
                hand: 0,
                k_accessed: vec![false; frames],
                k_dirty: vec![false; frames],
            }),
            swap,
            sharing,
        }
    }

    pub fn frame_data(&self, frame: usize) -> &RwLock<Box<[u8; PAGE_SIZE]>> {
        &self.data[frame]
    }

    /// Records a kernel access to `frame` in the alias bits.
    pub fn mark_kernel_access(&self, frame: usize, write: bool) {
        let mut state = self.state.lock();
        state.k_accessed[frame] = true;
        if write {
            state.k_dirty[frame] = true;
        }
    }

    /// Frames currently owned by a page, for inspection by tests.
    pub fn frames_in_use(&self) -> usize {
        self.state
            .lock()
            .owner
            .iter()
            .filter(|owner| owner.is_some())
            .count()
    }

    /// One clock sweep: advance the hand, clearing accessed bits, until a
    /// page with all accessed bits clear and no pin is found. The victim is
    /// removed from the table before this returns. `None` when a bounded
    /// sweep finds nothing evictable.
    fn run_clock(&self, state: &mut FrameState) -> Option<(usize, Arc<Page>)> {
        let frames = state.owner.len();
        for _ in 0..2 * frames {
            state.hand = (state.hand + 1) % frames;
            let hand = state.hand;
            let Some(page) = state.owner[hand].clone() else {
                continue;
            };
            let accessed = if page.is_shared_executable() {
                let accessed =
                    self.sharing.scan_and_clear_accessed(&page) || state.k_accessed[hand];
                state.k_accessed[hand] = false;
                if self.sharing.pinned(&page) {
                    continue;
                }
                accessed
            } else {
                let accessed = page.pd.is_accessed(page.vaddr) || state.k_accessed[hand];
                page.pd.set_accessed(page.vaddr, false);
                state.k_accessed[hand] = false;
                if page.pinned.load(std::sync::atomic::Ordering::SeqCst) {
                    continue;
                }
                accessed
            };
            if !accessed {
                state.owner[hand] = None;
                return Some((hand, page));
            }
        }
        None
    }

    /// Hands out a free frame, evicting a victim when the pool is empty.
    fn allocate(&self) -> Result<usize> {
        for _ in 0..1024 {
            let victim = {
                let mut state = self.state.lock();
                if let Some(frame) = state.free.pop() {
                    return Ok(frame);
                }
                self.run_clock(&mut state)
            };
            match victim {
                Some((frame, page)) => {
                    return match self.evict(frame, &page) {
                        Ok(()) => Ok(frame),
                        Err(err) => {
                            // Put the victim back; the caller's process dies,
                            // not the victim's.
                            self.state.lock().owner[frame] = Some(page);
                            Err(err)
                        }
                    };
                }
                None => std::thread::yield_now(),
            }
        }
        panic!("no evictable frames");
    }

    /// Pages the victim out. Called with the victim already removed from the
    /// table; takes `busy` only now.
    fn evict(&self, frame: usize, page: &Arc<Page>) -> Result<()> {
        let _busy = page.busy.lock();
        if *page.paddr.lock() != Some(frame) {
            // Torn down while we waited on busy; the frame is already free.
            return Ok(());
        }
        let k_dirty = self.state.lock().k_dirty[frame];

        if page.is_shared_executable() {
            log::trace!("evict: invalidating shared frame {}", frame);
            self.sharing.invalidate(page);
        } else {
            let mut source = page.source.lock();
            match &mut *source {
                PageSource::Executable { .. } | PageSource::Zero => {
                    let dirty = page.pd.is_dirty(page.vaddr) || k_dirty;
                    if dirty {
                        let slot = self.swap.allocate().ok_or(KernelError::NoSpace)?;
                        let data = self.data[frame].read();
                        self.swap.write_page(slot, &data);
                        *source = PageSource::Swap { slot: Some(slot) };
                        log::trace!("evict: frame {} -> swap slot {}", frame, slot);
                    }
                    page.pd.clear_page(page.vaddr);
                    *page.paddr.lock() = None;
                }
                PageSource::Swap { slot } => {
                    // The slot this page came in from was freed at page-in;
                    // the memory copy is the only one.
                    let new_slot = self.swap.allocate().ok_or(KernelError::NoSpace)?;
                    let data = self.data[frame].read();
                    self.swap.write_page(new_slot, &data);
                    *slot = Some(new_slot);
                    page.pd.clear_page(page.vaddr);
                    *page.paddr.lock() = None;
                }
                PageSource::Mmap {
                    file,
                    offset,
                    valid_bytes,
                    ..
                } => {
                    let dirty = page.pd.is_dirty(page.vaddr) || k_dirty;
                    if dirty {
                        let data = self.data[frame].read();
                        file.write_at(&data[..*valid_bytes as usize], *offset);
                        page.pd.set_dirty(page.vaddr, false);
                        log::trace!("evict: mmap frame {} written back", frame);
                    }
                    page.pd.clear_page(page.vaddr);
                    *page.paddr.lock() = None;
                }
            }
        }

        let mut state = self.state.lock();
        state.k_accessed[frame] = false;
        state.k_dirty[frame] = false;
        Ok(())
    }

    /// Makes `page` resident: adopt an existing shared frame when one
    /// exists, otherwise allocate a frame and fill it from the page's
    /// source. Installs the mapping with the page's writability.
    pub fn page_in(&self, page: &Arc<Page>) -> Result<()> {
        if page.is_shared_executable() {
            if !page
                .registered
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                self.sharing.register(page);
            }
            if self.sharing.adopt_shared_frame(page) {
                return Ok(());
            }
        }

        // Already resident (a racing fault beat us); just reinstall.
        {
            let _busy = page.busy.lock();
            if let Some(frame) = *page.paddr.lock() {
                page.pd.set_page(page.vaddr, frame, page.writable);
                return Ok(());
            }
        }

        let frame = self.allocate()?;
        let _busy = page.busy.lock();
        {
            let mut data = self.data[frame].write();
            let mut source = page.source.lock();
            match &mut *source {
                PageSource::Zero => data.fill(0),
                PageSource::Executable {
                    file,
                    offset,
                    valid_bytes,
                }
                | PageSource::Mmap {
                    file,
                    offset,
                    valid_bytes,
                    ..
                } => {
                    data.fill(0);
                    file.read_at(&mut data[..*valid_bytes as usize], *offset);
                }
                PageSource::Swap { slot } => {
                    let slot = slot.take().expect("page-in from swap without a slot");
                    self.swap.read_page(slot, &mut data);
                    self.swap.free(slot);
                }
            }
        }
        *page.paddr.lock() = Some(frame);
        page.pd.set_page(page.vaddr, frame, page.writable);

        let mut state = self.state.lock();
        state.owner[frame] = Some(Arc::clone(page));
        state.k_accessed[frame] = false;
        state.k_dirty[frame] = false;
        Ok(())
    }

    /// Forces `page` resident and flags it ineligible for eviction.
    pub fn pin(&self, page: &Arc<Page>) -> Result<()> {
        loop {
            page.pinned.store(true, std::sync::atomic::Ordering::SeqCst);
            if page.paddr.lock().is_some() {
                return Ok(());
            }
            self.page_in(page)?;
        }
    }

    pub fn unpin(&self, page: &Arc<Page>) {
        page.pinned.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Tears a page down at process exit or munmap: write back a dirty mmap
    /// frame, give the frame back (or hand a shared frame's table entry to a
    /// surviving sharer), and free any swap slot the page still holds.
    pub fn release_page(&self, page: &Arc<Page>) {
        let _busy = page.busy.lock();

        if page.is_shared_executable() {
            if page
                .registered
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                self.unregister_shared(page);
            }
            return;
        }

        // Dirty mmap contents reach the file before the frame disappears.
        let frame = *page.paddr.lock();
        if let Some(frame) = frame {
            let writeback = {
                let source = page.source.lock();
                match &*source {
                    PageSource::Mmap {
                        file,
                        offset,
                        valid_bytes,
                        ..
                    } if page.pd.is_dirty(page.vaddr) || self.state.lock().k_dirty[frame] => {
                        Some((Arc::clone(file), *offset, *valid_bytes))
                    }
                    _ => None,
                }
            };
            if let Some((file, offset, valid_bytes)) = writeback {
                let data = self.data[frame].read();
                file.write_at(&data[..valid_bytes as usize], offset);
            }

            let mut state = self.state.lock();
            if state.owner[frame]
                .as_ref()
                .map_or(false, |owner| Arc::ptr_eq(owner, page))
            {
                state.owner[frame] = None;
                state.free.push(frame);
                state.k_accessed[frame] = false;
                state.k_dirty[frame] = false;
            }
            drop(state);
            page.pd.clear_page(page.vaddr);
            *page.paddr.lock() = None;
        }

        if let PageSource::Swap { slot } = &mut *page.source.lock() {
            if let Some(slot) = slot.take() {
                self.swap.free(slot);
            }
        }
    }

    /// Removes `page` from its sharer list. If the page owned the frame
    /// table's entry and sharers remain, the entry (and the frame) pass to a
    /// survivor rather than being freed.
    fn unregister_shared(&self, page: &Arc<Page>) {
        let key = page.share_key().expect("not a shareable page");
        let frame = *page.paddr.lock();
        let mut state = self.state.lock();
        let mut map = self.sharing.map.lock();
        let Some(sharers) = map.get_mut(&key) else {
            return;
        };
        sharers.retain(|sharer| !Arc::ptr_eq(sharer, page));

        let owns = |state: &FrameState, frame: usize| {
            state.owner[frame]
                .as_ref()
                .map_or(false, |owner| Arc::ptr_eq(owner, page))
        };

        if sharers.is_empty() {
            map.remove(&key);
            if let Some(frame) = frame {
                if owns(&state, frame) {
                    state.owner[frame] = None;
                    state.free.push(frame);
                    state.k_accessed[frame] = false;
                    state.k_dirty[frame] = false;
                }
            }
        } else if let Some(frame) = frame {
            if owns(&state, frame) {
                let heir = Arc::clone(&sharers[0]);
                *heir.paddr.lock() = Some(frame);
                heir.pd.set_page(heir.vaddr, frame, false);
                state.owner[frame] = Some(heir);
            }
        }
        drop(map);
        drop(state);
        page.pd.clear_page(page.vaddr);
        *page.paddr.lock() = None;
    }
}
