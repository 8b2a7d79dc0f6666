//! System call dispatch.
//!
//! The narrow boundary between user programs and the kernel. The call number
//! and arguments are read off the user stack with every address validated
//! against the supplemental page table (growing the stack when the access
//! looks like stack growth, killing the process otherwise). Buffers handed
//! to read/write are validated at the first byte, every page boundary, and
//! the last byte, then pinned so the filesystem call cannot fault while
//! holding its own locks.
//!
//! Descriptor 0 reads one byte at a time from the console; descriptor 1
//! writes to the console in bounded chunks so one writer cannot monopolize
//! the output buffer.

use std::panic;
use std::sync::Arc;

use num_enum::TryFromPrimitive;
use scopeguard::guard;

use crate::fs::FsObject;
use crate::kernel::Kernel;
use crate::param::{CONSOLE_CHUNK, NAME_MAX, PAGE_SIZE};
use crate::proc::{self, kill_current, usermem, ExitCall, Halted, MmapRegion, Process};
use crate::vm::addr::is_user_vaddr;
use crate::vm::page::is_stack_access;
use usermem::Access;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SyscallNr {
    Halt = 0,
    Exit,
    Exec,
    Wait,
    Create,
    Remove,
    Open,
    Filesize,
    Read,
    Write,
    Seek,
    Tell,
    Close,
    Mmap,
    Munmap,
    Chdir,
    Mkdir,
    Readdir,
    Isdir,
    Inumber,
}

/// Longest command line or path accepted from user space.
const STR_MAX: usize = PAGE_SIZE;

/// Entry point from the trap: `esp` is the user stack pointer, with the call
/// number at `esp` and arguments above it.
pub fn handler(kernel: &Arc<Kernel>, proc: &Arc<Process>, esp: usize) -> i32 {
    proc.set_esp(esp);
    let nr = read_word(kernel, proc, esp);
    let Ok(nr) = SyscallNr::try_from(nr) else {
        log::debug!("{}: unknown syscall {}", proc.name, nr);
        kill_current();
    };
    let arg = |i: usize| read_word(kernel, proc, esp + 4 * i);

    match nr {
        SyscallNr::Halt => sys_halt(kernel),
        SyscallNr::Exit => sys_exit(kernel, proc, arg(1) as i32),
        SyscallNr::Exec => sys_exec(kernel, proc, arg(1) as usize),
        SyscallNr::Wait => proc::wait(kernel, proc.tid, arg(1)),
        SyscallNr::Create => sys_create(kernel, proc, arg(1) as usize, arg(2)),
        SyscallNr::Remove => sys_remove(kernel, proc, arg(1) as usize),
        SyscallNr::Open => sys_open(kernel, proc, arg(1) as usize),
        SyscallNr::Filesize => sys_filesize(proc, arg(1) as i32),
        SyscallNr::Read => sys_read(kernel, proc, arg(1) as i32, arg(2) as usize, arg(3) as usize),
        SyscallNr::Write => {
            sys_write(kernel, proc, arg(1) as i32, arg(2) as usize, arg(3) as usize)
        }
        SyscallNr::Seek => sys_seek(proc, arg(1) as i32, arg(2)),
        SyscallNr::Tell => sys_tell(proc, arg(1) as i32),
        SyscallNr::Close => sys_close(proc, arg(1) as i32),
        SyscallNr::Mmap => sys_mmap(proc, arg(1) as i32, arg(2) as usize),
        SyscallNr::Munmap => sys_munmap(kernel, proc, arg(1) as i32),
        SyscallNr::Chdir => sys_chdir(kernel, proc, arg(1) as usize),
        SyscallNr::Mkdir => sys_mkdir(kernel, proc, arg(1) as usize),
        SyscallNr::Readdir => sys_readdir(kernel, proc, arg(1) as i32, arg(2) as usize),
        SyscallNr::Isdir => sys_isdir(proc, arg(1) as i32),
        SyscallNr::Inumber => sys_inumber(proc, arg(1) as i32),
    }
}

/// Validates one user address: mapped in the supplemental table, or a
/// stack-growth access (which grows the stack). Anything else kills the
/// process.
fn verify_uaddr(kernel: &Kernel, proc: &Process, va: usize) {
    if !is_user_vaddr(va) {
        kill_current();
    }
    if proc.supp.lookup(va).is_some() {
        return;
    }
    if is_stack_access(va, proc.esp())
        && kernel
            .vm
            .extend_stack(&proc.supp, &proc.pd, va)
            .is_ok()
    {
        return;
    }
    kill_current();
}

/// Validates a buffer at its first byte, every page boundary, and its last
/// byte.
fn check_buffer(kernel: &Kernel, proc: &Process, va: usize, len: usize) {
    verify_uaddr(kernel, proc, va);
    if len == 0 {
        return;
    }
    let mut boundary = va - va % PAGE_SIZE + PAGE_SIZE;
    while boundary < va + len - 1 {
        verify_uaddr(kernel, proc, boundary);
        boundary += PAGE_SIZE;
    }
    verify_uaddr(kernel, proc, va + len - 1);
}

fn read_word(kernel: &Kernel, proc: &Process, va: usize) -> u32 {
    verify_uaddr(kernel, proc, va);
    match usermem::read_user_u32(kernel, proc, va, Access::Kernel) {
        Ok(word) => word,
        Err(_) => kill_current(),
    }
}

fn read_str(kernel: &Kernel, proc: &Process, va: usize) -> String {
    verify_uaddr(kernel, proc, va);
    match usermem::read_user_cstr(kernel, proc, va, STR_MAX, Access::Kernel) {
        Ok(s) => s,
        Err(_) => kill_current(),
    }
}

fn sys_halt(kernel: &Arc<Kernel>) -> ! {
    kernel.halt();
    panic::panic_any(Halted)
}

fn sys_exit(kernel: &Arc<Kernel>, proc: &Arc<Process>, status: i32) -> ! {
    if let Some(record) = kernel.procs.record_of(proc.tid) {
        record.set_exit_code(status);
    }
    panic::panic_any(ExitCall)
}

fn sys_exec(kernel: &Arc<Kernel>, proc: &Arc<Process>, cmdline_va: usize) -> i32 {
    let cmdline = read_str(kernel, proc, cmdline_va);
    match proc::exec(kernel, proc.tid, &cmdline) {
        Ok(tid) => tid as i32,
        Err(err) => {
            log::debug!("exec '{}' failed: {}", cmdline, err);
            -1
        }
    }
}

fn sys_create(kernel: &Kernel, proc: &Process, path_va: usize, size: u32) -> i32 {
    let path = read_str(kernel, proc, path_va);
    kernel.fs.create(&path, size, proc.cwd()).is_ok() as i32
}

fn sys_remove(kernel: &Kernel, proc: &Process, path_va: usize) -> i32 {
    let path = read_str(kernel, proc, path_va);
    let protected = kernel.procs.cwds();
    kernel.fs.remove(&path, proc.cwd(), &protected).is_ok() as i32
}

fn sys_open(kernel: &Kernel, proc: &Process, path_va: usize) -> i32 {
    let path = read_str(kernel, proc, path_va);
    match kernel.fs.open(&path, proc.cwd()) {
        // A full descriptor table closes the object again and fails the
        // call, like any other resource exhaustion.
        Ok(obj) => proc.insert_fd(obj).unwrap_or(-1),
        Err(_) => -1,
    }
}

fn sys_filesize(proc: &Process, fd: i32) -> i32 {
    if fd == 0 || fd == 1 {
        return 0;
    }
    match proc.lookup_fd(fd) {
        Some(FsObject::File(file)) => file.len() as i32,
        _ => -1,
    }
}

fn sys_read(kernel: &Kernel, proc: &Arc<Process>, fd: i32, buf_va: usize, len: usize) -> i32 {
    check_buffer(kernel, proc, buf_va, len);
    if fd == 0 {
        for i in 0..len {
            let byte = kernel.console.getc();
            if usermem::copy_to_user(kernel, proc, buf_va + i, &[byte], Access::Kernel).is_err() {
                kill_current();
            }
        }
        return len as i32;
    }
    let Some(FsObject::File(file)) = proc.lookup_fd(fd) else {
        return -1;
    };
    let pinned = match usermem::pin_buffer(kernel, proc, buf_va, len) {
        Ok(pages) => pages,
        Err(_) => kill_current(),
    };
    let pinned = guard(pinned, |pages| usermem::unpin_all(kernel, &pages));

    let mut tmp = vec![0u8; len];
    let n = file.read(&mut tmp);
    if usermem::copy_to_user(kernel, proc, buf_va, &tmp[..n], Access::Kernel).is_err() {
        kill_current();
    }
    drop(pinned);
    n as i32
}

fn sys_write(kernel: &Kernel, proc: &Arc<Process>, fd: i32, buf_va: usize, len: usize) -> i32 {
    check_buffer(kernel, proc, buf_va, len);
    if fd == 1 {
        let mut tmp = vec![0u8; len];
        if usermem::copy_from_user(kernel, proc, buf_va, &mut tmp, Access::Kernel).is_err() {
            kill_current();
        }
        for chunk in tmp.chunks(CONSOLE_CHUNK) {
            kernel.console.putbuf(chunk);
        }
        return len as i32;
    }
    let Some(FsObject::File(file)) = proc.lookup_fd(fd) else {
        return -1;
    };
    let pinned = match usermem::pin_buffer(kernel, proc, buf_va, len) {
        Ok(pages) => pages,
        Err(_) => kill_current(),
    };
    let pinned = guard(pinned, |pages| usermem::unpin_all(kernel, &pages));

    let mut tmp = vec![0u8; len];
    if usermem::copy_from_user(kernel, proc, buf_va, &mut tmp, Access::Kernel).is_err() {
        kill_current();
    }
    let n = file.write(&tmp);
    drop(pinned);
    n as i32
}

fn sys_seek(proc: &Process, fd: i32, pos: u32) -> i32 {
    if let Some(FsObject::File(file)) = proc.lookup_fd(fd) {
        file.seek(pos);
    }
    0
}

fn sys_tell(proc: &Process, fd: i32) -> i32 {
    match proc.lookup_fd(fd) {
        Some(FsObject::File(file)) => file.tell() as i32,
        _ => -1,
    }
}

fn sys_close(proc: &Process, fd: i32) -> i32 {
    proc.remove_fd(fd);
    0
}

fn sys_mmap(proc: &Arc<Process>, fd: i32, va: usize) -> i32 {
    if !is_user_vaddr(va) {
        kill_current();
    }
    let Some(FsObject::File(file)) = proc.lookup_fd(fd) else {
        return -1;
    };
    let len = file.len();
    if len == 0 || va == 0 || va % PAGE_SIZE != 0 {
        return -1;
    }
    let pages = (len as usize - 1) / PAGE_SIZE + 1;

    // The whole range must be free user address space.
    for i in 0..pages {
        let page_va = va + i * PAGE_SIZE;
        if !is_user_vaddr(page_va) || proc.supp.lookup(page_va).is_some() {
            return -1;
        }
    }

    // An independent handle, so the mapping's file position is its own.
    let mapped = Arc::new(file.reopen());
    let mapid = fd;
    for i in 0..pages {
        let offset = (i * PAGE_SIZE) as u32;
        let valid = (len - offset).min(PAGE_SIZE as u32);
        if proc
            .supp
            .insert_mmap(
                va + i * PAGE_SIZE,
                Arc::clone(&proc.pd),
                mapid,
                Arc::clone(&mapped),
                offset,
                valid,
            )
            .is_err()
        {
            for j in 0..i {
                proc.supp.remove(va + j * PAGE_SIZE);
            }
            return -1;
        }
    }
    proc.mmaps.lock().push(MmapRegion {
        mapid,
        file: mapped,
        base: va,
        len,
    });
    mapid
}

fn sys_munmap(kernel: &Kernel, proc: &Arc<Process>, mapid: i32) -> i32 {
    let region = {
        let mut mmaps = proc.mmaps.lock();
        match mmaps.iter().position(|r| r.mapid == mapid) {
            Some(i) => mmaps.remove(i),
            None => return 0,
        }
    };
    munmap_region(kernel, proc, &region);
    0
}

/// Unmaps one region: dirty pages are written back to the file, frames are
/// freed, page-directory entries cleared, supplemental pages deleted.
pub(crate) fn munmap_region(kernel: &Kernel, proc: &Process, region: &MmapRegion) {
    let pages = (region.len as usize - 1) / PAGE_SIZE + 1;
    for i in 0..pages {
        if let Some(page) = proc.supp.remove(region.base + i * PAGE_SIZE) {
            kernel.vm.frames.release_page(&page);
        }
    }
    log::trace!("munmap id {} ({} pages)", region.mapid, pages);
}

fn sys_chdir(kernel: &Kernel, proc: &Process, path_va: usize) -> i32 {
    let path = read_str(kernel, proc, path_va);
    match kernel.fs.chdir_lookup(&path, proc.cwd()) {
        Ok(sector) => {
            proc.set_cwd(sector);
            1
        }
        Err(_) => 0,
    }
}

fn sys_mkdir(kernel: &Kernel, proc: &Process, path_va: usize) -> i32 {
    let path = read_str(kernel, proc, path_va);
    kernel.fs.mkdir(&path, proc.cwd()).is_ok() as i32
}

fn sys_readdir(kernel: &Kernel, proc: &Process, fd: i32, name_va: usize) -> i32 {
    check_buffer(kernel, proc, name_va, NAME_MAX + 1);
    let Some(FsObject::Dir(dir)) = proc.lookup_fd(fd) else {
        return 0;
    };
    match dir.read_next() {
        Some(name) => {
            let mut bytes = name.into_bytes();
            bytes.push(0);
            if usermem::copy_to_user(kernel, proc, name_va, &bytes, Access::Kernel).is_err() {
                kill_current();
            }
            1
        }
        None => 0,
    }
}

fn sys_isdir(proc: &Process, fd: i32) -> i32 {
    matches!(proc.lookup_fd(fd), Some(FsObject::Dir(_))) as i32
}

fn sys_inumber(proc: &Process, fd: i32) -> i32 {
    match proc.lookup_fd(fd) {
        Some(FsObject::File(file)) => file.inumber() as i32,
        Some(FsObject::Dir(dir)) => dir.inumber() as i32,
        None => -1,
    }
}
