//! User-memory access.
//!
//! Every transfer between kernel and user space goes through the process's
//! page directory, faulting pages in on demand and keeping the accessed and
//! dirty bits honest. A transfer holds the page's busy lock for the duration
//! of each per-page chunk, so eviction can never pull the frame out from
//! under a copy in progress.
//!
//! `Access::User` models a load/store issued by user code (page-directory
//! bits are set); `Access::Kernel` models the kernel touching user memory on
//! the user's behalf during a syscall (the frame's kernel-alias bits are
//! set).

use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::param::PAGE_SIZE;
use crate::proc::Process;
use crate::vm::addr::{is_user_vaddr, pg_ofs, pg_round_down};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Access {
    User,
    Kernel,
}

/// Runs `f` against the frame bytes backing the page at `vaddr`, faulting
/// the page in first. `write` selects the permission check and which dirty
/// bit is set.
fn with_page<R>(
    kernel: &Kernel,
    proc: &Process,
    vaddr: usize,
    write: bool,
    access: Access,
    f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
) -> Result<R> {
    if !is_user_vaddr(vaddr) {
        return Err(KernelError::NotFound);
    }
    let vpage = pg_round_down(vaddr);
    loop {
        match proc.supp.lookup(vpage) {
            Some(page) => {
                {
                    let _busy = page.busy.lock();
                    if let Some((frame, writable)) = proc.pd.lookup(vpage) {
                        if write && !writable {
                            return Err(KernelError::WriteDenied);
                        }
                        match access {
                            Access::User => {
                                proc.pd.mark_access(vpage, write);
                            }
                            Access::Kernel => kernel.vm.frames.mark_kernel_access(frame, write),
                        }
                        let mut data = kernel.vm.frames.frame_data(frame).write();
                        return Ok(f(&mut **data));
                    }
                }
                // Mapped out since the last fault; bring it back.
                kernel.vm.frames.page_in(&page)?;
            }
            None => {
                kernel
                    .vm
                    .handle_fault(&proc.supp, &proc.pd, vpage, proc.esp())?;
            }
        }
    }
}

/// Copies `bytes` into user space at `va`.
pub fn copy_to_user(
    kernel: &Kernel,
    proc: &Process,
    va: usize,
    bytes: &[u8],
    access: Access,
) -> Result<()> {
    let mut done = 0;
    while done < bytes.len() {
        let ofs = pg_ofs(va + done);
        let chunk = (PAGE_SIZE - ofs).min(bytes.len() - done);
        with_page(kernel, proc, va + done, true, access, |data| {
            data[ofs..ofs + chunk].copy_from_slice(&bytes[done..done + chunk]);
        })?;
        done += chunk;
    }
    Ok(())
}

/// Copies `buf.len()` bytes out of user space at `va`.
pub fn copy_from_user(
    kernel: &Kernel,
    proc: &Process,
    va: usize,
    buf: &mut [u8],
    access: Access,
) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let ofs = pg_ofs(va + done);
        let chunk = (PAGE_SIZE - ofs).min(buf.len() - done);
        with_page(kernel, proc, va + done, false, access, |data| {
            buf[done..done + chunk].copy_from_slice(&data[ofs..ofs + chunk]);
        })?;
        done += chunk;
    }
    Ok(())
}

pub fn read_user_u32(kernel: &Kernel, proc: &Process, va: usize, access: Access) -> Result<u32> {
    let mut bytes = [0u8; 4];
    copy_from_user(kernel, proc, va, &mut bytes, access)?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn write_user_u32(
    kernel: &Kernel,
    proc: &Process,
    va: usize,
    value: u32,
    access: Access,
) -> Result<()> {
    copy_to_user(kernel, proc, va, &value.to_le_bytes(), access)
}

/// Reads a NUL-terminated string of at most `max` bytes from user space.
pub fn read_user_cstr(
    kernel: &Kernel,
    proc: &Process,
    va: usize,
    max: usize,
    access: Access,
) -> Result<String> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    for i in 0..max {
        copy_from_user(kernel, proc, va + i, &mut byte, access)?;
        if byte[0] == 0 {
            return String::from_utf8(out).map_err(|_| KernelError::InvalidPath);
        }
        out.push(byte[0]);
    }
    Err(KernelError::InvalidPath)
}

/// Pins every page covered by `(va, len)` so a filesystem call cannot fault
/// while holding its own locks. Returns the pinned pages; the caller unpins.
pub fn pin_buffer(
    kernel: &Kernel,
    proc: &Arc<Process>,
    va: usize,
    len: usize,
) -> Result<Vec<Arc<crate::vm::page::Page>>> {
    let mut pages = Vec::new();
    if len == 0 {
        return Ok(pages);
    }
    let first = pg_round_down(va);
    let last = pg_round_down(va + len - 1);
    let mut vpage = first;
    loop {
        let page = proc
            .supp
            .lookup(vpage)
            .ok_or(KernelError::NotFound)?;
        kernel.vm.frames.pin(&page)?;
        pages.push(page);
        if vpage == last {
            break;
        }
        vpage += PAGE_SIZE;
    }
    Ok(pages)
}

pub fn unpin_all(kernel: &Kernel, pages: &[Arc<crate::vm::page::Page>]) {
    for page in pages {
        kernel.vm.frames.unpin(page);
    }
}
