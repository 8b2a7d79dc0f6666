//! Demand-paged virtual memory.
//!
//! Ties together the supplemental page tables (per process), the global
//! frame table with its eviction clock, the swap-slot allocator, and the
//! read-only executable sharing table. The process layer consults this
//! module on every page fault.

pub mod addr;
pub mod frame;
pub mod page;
pub mod pagedir;
pub mod sharing;
pub mod swap;

use std::sync::Arc;

use crate::dev::BlockDevice;
use crate::error::{KernelError, Result};
use crate::param::{PHYS_BASE, STACK_LIMIT};
use addr::{is_user_vaddr, pg_round_down};
use frame::FrameTable;
use page::{is_stack_access, SuppTable};
use pagedir::PageDir;
use sharing::SharingTable;
use swap::SwapTable;

pub struct Vm {
    pub frames: FrameTable,
    pub sharing: Arc<SharingTable>,
    pub swap: Arc<SwapTable>,
}

impl Vm {
    pub fn new(frames: usize, swap_dev: Arc<dyn BlockDevice>) -> Self {
        let swap = Arc::new(SwapTable::new(swap_dev));
        let sharing = Arc::new(SharingTable::new());
        Self {
            frames: FrameTable::new(frames, Arc::clone(&swap), Arc::clone(&sharing)),
            sharing,
            swap,
        }
    }

    /// Resolves a fault at `vaddr`: page in the registered source if one
    /// exists, grow the stack if the access looks like stack growth, and
    /// fail otherwise (the caller kills the process).
    pub fn handle_fault(
        &self,
        supp: &SuppTable,
        pd: &Arc<PageDir>,
        vaddr: usize,
        esp: usize,
    ) -> Result<()> {
        if !is_user_vaddr(vaddr) {
            return Err(KernelError::NotFound);
        }
        if let Some(page) = supp.lookup(vaddr) {
            return self.frames.page_in(&page);
        }
        if is_stack_access(vaddr, esp) {
            return self.extend_stack(supp, pd, vaddr);
        }
        Err(KernelError::NotFound)
    }

    /// Installs and pages in a zero page for a stack access at `vaddr`.
    pub fn extend_stack(&self, supp: &SuppTable, pd: &Arc<PageDir>, vaddr: usize) -> Result<()> {
        if vaddr >= PHYS_BASE || vaddr < PHYS_BASE - STACK_LIMIT {
            return Err(KernelError::NotFound);
        }
        let page = match supp.insert_zero(pg_round_down(vaddr), Arc::clone(pd)) {
            Ok(page) => page,
            // Lost a race with another fault on the same page.
            Err(KernelError::AlreadyExists) => supp
                .lookup(vaddr)
                .ok_or(KernelError::NotFound)?,
            Err(err) => return Err(err),
        };
        log::trace!("stack grown to page {:#x}", page.vaddr);
        self.frames.page_in(&page)
    }

    /// Destroys every page of a supplemental table at process exit, freeing
    /// swap slots and backing frames through the sharing-aware release path.
    pub fn free_all(&self, supp: &SuppTable) {
        for page in supp.drain() {
            self.frames.release_page(&page);
        }
    }
}
