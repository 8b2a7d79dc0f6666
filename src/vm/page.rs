//! Supplemental page table.
//!
//! Per-process map from virtual page to where that page's contents live when
//! they are not in a physical frame: a file (executable image or mmap), a
//! swap slot, or nowhere at all (a fresh zero page). The frame table
//! consults it on every page fault and eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KernelError, Result};
use crate::fs::file::File;
use crate::param::{PHYS_BASE, STACK_LIMIT};
use crate::vm::addr::pg_round_down;
use crate::vm::pagedir::PageDir;
use crate::vm::swap::SwapSlot;

pub type MapId = i32;

/// Where a page's contents live while it is not resident.
pub enum PageSource {
    /// Faults in a freshly zeroed frame.
    Zero,
    /// Backed by an executable image. Read-only pages of the same
    /// `(inode, offset)` are shared across processes.
    Executable {
        file: Arc<File>,
        offset: u32,
        valid_bytes: u32,
    },
    /// Backed by a memory-mapped file; dirty pages are written back to it.
    Mmap {
        mapid: MapId,
        file: Arc<File>,
        offset: u32,
        valid_bytes: u32,
    },
    /// Lives in a swap slot. The slot is consumed on page-in; eviction
    /// allocates a fresh one.
    Swap { slot: Option<SwapSlot> },
}

pub struct Page {
    /// Page-aligned user virtual address.
    pub vaddr: usize,
    pub pd: Arc<PageDir>,
    pub writable: bool,
    /// Sharing key of a read-only executable page. Such pages never change
    /// source, so this is fixed at insertion.
    share: Option<(u32, u32)>,
    /// Pinned pages are skipped by the eviction clock.
    pub pinned: AtomicBool,
    /// Physical frame currently holding the page, if any.
    pub paddr: Mutex<Option<usize>>,
    pub source: Mutex<PageSource>,
    /// Held while the page is being paged in, paged out, or torn down.
    pub busy: Mutex<()>,
    /// Whether this page has joined the executable-sharing table.
    pub registered: AtomicBool,
}

impl Page {
    fn new(vaddr: usize, pd: Arc<PageDir>, writable: bool, source: PageSource) -> Arc<Self> {
        let share = match &source {
            PageSource::Executable { file, offset, .. } if !writable => {
                Some((file.inumber(), *offset))
            }
            _ => None,
        };
        Arc::new(Self {
            vaddr: pg_round_down(vaddr),
            pd,
            writable,
            share,
            pinned: AtomicBool::new(false),
            paddr: Mutex::new(None),
            source: Mutex::new(source),
            busy: Mutex::new(()),
            registered: AtomicBool::new(false),
        })
    }

    /// True for a read-only executable page, the kind whose frames are
    /// shared across processes.
    pub fn is_shared_executable(&self) -> bool {
        self.share.is_some()
    }

    /// Sharing key of a read-only executable page.
    pub fn share_key(&self) -> Option<(u32, u32)> {
        self.share
    }
}

/// Per-process supplemental page table.
pub struct SuppTable {
    pages: Mutex<HashMap<usize, Arc<Page>>>,
}

impl Default for SuppTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SuppTable {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, page: Arc<Page>) -> Result<Arc<Page>> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page.vaddr) {
            return Err(KernelError::AlreadyExists);
        }
        pages.insert(page.vaddr, Arc::clone(&page));
        Ok(page)
    }

    pub fn insert_zero(&self, vaddr: usize, pd: Arc<PageDir>) -> Result<Arc<Page>> {
        self.insert(Page::new(vaddr, pd, true, PageSource::Zero))
    }

    pub fn insert_executable(
        &self,
        vaddr: usize,
        pd: Arc<PageDir>,
        file: Arc<File>,
        offset: u32,
        valid_bytes: u32,
        writable: bool,
    ) -> Result<Arc<Page>> {
        self.insert(Page::new(
            vaddr,
            pd,
            writable,
            PageSource::Executable {
                file,
                offset,
                valid_bytes,
            },
        ))
    }

    pub fn insert_mmap(
        &self,
        vaddr: usize,
        pd: Arc<PageDir>,
        mapid: MapId,
        file: Arc<File>,
        offset: u32,
        valid_bytes: u32,
    ) -> Result<Arc<Page>> {
        self.insert(Page::new(
            vaddr,
            pd,
            true,
            PageSource::Mmap {
                mapid,
                file,
                offset,
                valid_bytes,
            },
        ))
    }

    pub fn lookup(&self, vaddr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&pg_round_down(vaddr)).cloned()
    }

    pub fn remove(&self, vaddr: usize) -> Option<Arc<Page>> {
        self.pages.lock().remove(&pg_round_down(vaddr))
    }

    /// Takes every page out of the table, for teardown at process exit.
    pub fn drain(&self) -> Vec<Arc<Page>> {
        self.pages.lock().drain().map(|(_, page)| page).collect()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}

/// Whether a fault at `vaddr` with trapped stack pointer `esp` looks like
/// stack growth: at or above the stack pointer, or one of the two fixed
/// offsets a push writes below it.
pub fn is_stack_access(vaddr: usize, esp: usize) -> bool {
    if vaddr >= PHYS_BASE || vaddr < PHYS_BASE - STACK_LIMIT {
        return false;
    }
    vaddr >= esp || vaddr + 4 == esp || vaddr + 32 == esp
}
