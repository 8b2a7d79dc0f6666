//! Processes.
//!
//! A process is a kernel thread plus a page directory, a supplemental page
//! table, a file-descriptor table, a table of memory-mapped regions, and a
//! current directory. Parent/child exit synchronization runs through process
//! records: a record outlives its process until both the process and its
//! parent have finished, or the parent waits on it.
//!
//! Loading follows the executable contract without the ELF plumbing: the
//! named program body comes from the kernel's registry, while the executable
//! *file* is opened, write-denied, and mapped read-only page by page, so
//! demand paging and cross-process code sharing behave exactly as they would
//! for a real text segment. The argv words land on the initial stack page in
//! the usual layout: strings, alignment, NULL sentinel, argv[], argv, argc,
//! fake return address.

pub mod syscall;
pub mod usermem;

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::dev::SectorId;
use crate::error::{KernelError, Result};
use crate::fs::file::File;
use crate::fs::FsObject;
use crate::kernel::Kernel;
use crate::lock::Semaphore;
use crate::param::{CODE_BASE, NOFILE, PAGE_SIZE, PHYS_BASE, ROOT_DIR_SECTOR};
use crate::vm::page::{MapId, SuppTable};
use crate::vm::pagedir::PageDir;
use usermem::Access;

pub type Tid = u32;

/// Unwind payload: the process was killed by the kernel (exit code -1).
pub struct Killed;

/// Unwind payload: the process called the exit syscall; the exit code is
/// already recorded.
pub struct ExitCall;

/// Unwind payload: the machine was halted.
pub struct Halted;

/// Terminates the current process for a protection violation.
pub fn kill_current() -> ! {
    panic::panic_any(Killed)
}

/// A memory-mapped file region.
pub struct MmapRegion {
    pub mapid: MapId,
    pub file: Arc<File>,
    pub base: usize,
    pub len: u32,
}

pub struct Process {
    pub tid: Tid,
    pub name: String,
    pub parent: Tid,
    pub pd: Arc<PageDir>,
    pub supp: Arc<SuppTable>,
    files: Mutex<HashMap<i32, FsObject>>,
    next_fd: AtomicI32,
    pub mmaps: Mutex<Vec<MmapRegion>>,
    cwd: AtomicU32,
    pub executable: Mutex<Option<Arc<File>>>,
    /// Stack pointer recorded at the last trap, for the stack-growth
    /// heuristic.
    esp: AtomicUsize,
}

impl Process {
    fn new(tid: Tid, name: String, parent: Tid, cwd: SectorId) -> Arc<Self> {
        Arc::new(Self {
            tid,
            name,
            parent,
            pd: Arc::new(PageDir::new()),
            supp: Arc::new(SuppTable::new()),
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(2),
            mmaps: Mutex::new(Vec::new()),
            cwd: AtomicU32::new(cwd),
            executable: Mutex::new(None),
            esp: AtomicUsize::new(PHYS_BASE),
        })
    }

    pub fn cwd(&self) -> SectorId {
        self.cwd.load(Ordering::SeqCst)
    }

    pub fn set_cwd(&self, sector: SectorId) {
        self.cwd.store(sector, Ordering::SeqCst);
    }

    pub fn esp(&self) -> usize {
        self.esp.load(Ordering::SeqCst)
    }

    pub fn set_esp(&self, esp: usize) {
        self.esp.store(esp, Ordering::SeqCst);
    }

    /// Hands out the next descriptor, or `None` when the table already
    /// holds `NOFILE` entries.
    pub fn insert_fd(&self, obj: FsObject) -> Option<i32> {
        let mut files = self.files.lock();
        if files.len() >= NOFILE {
            return None;
        }
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        files.insert(fd, obj);
        Some(fd)
    }

    pub fn lookup_fd(&self, fd: i32) -> Option<FsObject> {
        self.files.lock().get(&fd).cloned()
    }

    pub fn remove_fd(&self, fd: i32) -> Option<FsObject> {
        self.files.lock().remove(&fd)
    }
}

struct RecordState {
    finished: bool,
    parent_finished: bool,
    exit_code: i32,
}

/// Exit bookkeeping for one process; freed when both the process and its
/// parent have finished, or when the parent waits.
pub struct ProcRecord {
    pub tid: Tid,
    pub parent_tid: Tid,
    state: Mutex<RecordState>,
    pub sema: Semaphore,
}

impl ProcRecord {
    fn new(tid: Tid, parent_tid: Tid) -> Arc<Self> {
        Arc::new(Self {
            tid,
            parent_tid,
            state: Mutex::new(RecordState {
                finished: false,
                parent_finished: false,
                exit_code: -1,
            }),
            sema: Semaphore::new(0),
        })
    }

    pub fn set_exit_code(&self, code: i32) {
        self.state.lock().exit_code = code;
    }

    pub fn exit_code(&self) -> i32 {
        self.state.lock().exit_code
    }
}

pub struct ProcTable {
    records: Mutex<Vec<Arc<ProcRecord>>>,
    procs: Mutex<HashMap<Tid, Arc<Process>>>,
    next_tid: AtomicU32,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            procs: Mutex::new(HashMap::new()),
            next_tid: AtomicU32::new(1),
            threads: Mutex::new(Vec::new()),
        }
    }

    fn alloc_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, tid: Tid) -> Option<Arc<Process>> {
        self.procs.lock().get(&tid).cloned()
    }

    pub fn record_of(&self, tid: Tid) -> Option<Arc<ProcRecord>> {
        self.records.lock().iter().find(|r| r.tid == tid).cloned()
    }

    /// Current directories of every live process, for removal protection.
    pub fn cwds(&self) -> Vec<SectorId> {
        self.procs.lock().values().map(|p| p.cwd()).collect()
    }

    pub fn running(&self) -> usize {
        self.procs.lock().len()
    }

    /// Joins every process thread that has been spawned. Call after the
    /// processes have exited.
    pub fn join_all(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
    }
}

/// Spawns a child running `cmdline`. Blocks until the child has loaded (or
/// failed to), like the original: the returned tid is only handed out once
/// the load outcome is known.
pub fn exec(kernel: &Arc<Kernel>, parent: Tid, cmdline: &str) -> Result<Tid> {
    let name = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidPath)?
        .to_string();
    let cwd = kernel
        .procs
        .get(parent)
        .map_or(ROOT_DIR_SECTOR, |p| p.cwd());
    let tid = kernel.procs.alloc_tid();
    let loaded = Arc::new(Semaphore::new(0));
    let success = Arc::new(AtomicBool::new(false));

    let thread = {
        let kernel = Arc::clone(kernel);
        let cmdline = cmdline.to_string();
        let loaded = Arc::clone(&loaded);
        let success = Arc::clone(&success);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || start_process(kernel, cmdline, parent, tid, cwd, loaded, success))
            .map_err(|_| KernelError::NoSpace)?
    };
    kernel.procs.threads.lock().push(thread);

    loaded.down();
    if success.load(Ordering::SeqCst) {
        Ok(tid)
    } else {
        Err(KernelError::NotFound)
    }
}

fn start_process(
    kernel: Arc<Kernel>,
    cmdline: String,
    parent: Tid,
    tid: Tid,
    cwd: SectorId,
    loaded: Arc<Semaphore>,
    success: Arc<AtomicBool>,
) {
    let name = cmdline.split_whitespace().next().unwrap_or("").to_string();
    let proc = Process::new(tid, name, parent, cwd);
    let record = ProcRecord::new(tid, parent);
    kernel.procs.records.lock().push(Arc::clone(&record));
    kernel.procs.procs.lock().insert(tid, Arc::clone(&proc));

    let body = load(&kernel, &proc, &cmdline);
    success.store(body.is_ok(), Ordering::SeqCst);
    loaded.up();

    let body = match body {
        Ok(body) => body,
        Err(err) => {
            log::debug!("load of '{}' failed: {}", cmdline, err);
            process_exit(&kernel, &proc);
            return;
        }
    };
    run_user_body(&kernel, &proc, &record, |ctx| body(ctx));
}

/// Runs a user program body, translating its unwind outcomes into the exit
/// path.
pub(crate) fn run_user_body(
    kernel: &Arc<Kernel>,
    proc: &Arc<Process>,
    record: &Arc<ProcRecord>,
    body: impl FnOnce(&UserCtx) -> i32,
) {
    let ctx = UserCtx::new(Arc::clone(kernel), Arc::clone(proc));
    match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
        Ok(code) => record.set_exit_code(code),
        Err(payload) => {
            if payload.is::<Halted>() {
                // Machine off: no exit bookkeeping, but release any waiter.
                record.sema.up();
                return;
            }
            if !payload.is::<Killed>() && !payload.is::<ExitCall>() {
                // A genuine bug, not a kernel-initiated unwind. Release any
                // waiter before surfacing it.
                record.sema.up();
                panic::resume_unwind(payload);
            }
        }
    }
    process_exit(kernel, proc);
}

/// Resolves the program body and builds the child's address space: the
/// executable file mapped read-only at the code base, and the argv stack.
fn load(
    kernel: &Arc<Kernel>,
    proc: &Arc<Process>,
    cmdline: &str,
) -> Result<crate::kernel::Program> {
    let exe = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidPath)?;
    let body = kernel.program(exe).ok_or(KernelError::NotFound)?;
    let file = kernel.fs.open_file(exe, proc.cwd())?;
    file.deny_write();
    let len = file.len();
    if len == 0 {
        return Err(KernelError::NotFound);
    }

    let mut offset = 0u32;
    while offset < len {
        let valid = (len - offset).min(PAGE_SIZE as u32);
        proc.supp.insert_executable(
            CODE_BASE + offset as usize,
            Arc::clone(&proc.pd),
            Arc::clone(&file),
            offset,
            valid,
            false,
        )?;
        offset += PAGE_SIZE as u32;
    }
    *proc.executable.lock() = Some(file);
    setup_stack(kernel, proc, cmdline)?;
    Ok(body)
}

/// Builds the initial user stack from the command line.
fn setup_stack(kernel: &Kernel, proc: &Arc<Process>, cmdline: &str) -> Result<()> {
    let stack_page = PHYS_BASE - PAGE_SIZE;
    proc.supp.insert_zero(stack_page, Arc::clone(&proc.pd))?;

    let args: Vec<&str> = cmdline.split_whitespace().collect();
    let mut sp = PHYS_BASE;
    let mut arg_addrs = Vec::with_capacity(args.len());

    // Argument strings, first argument highest.
    for arg in &args {
        sp -= arg.len() + 1;
        usermem::copy_to_user(kernel, proc, sp, arg.as_bytes(), Access::User)?;
        arg_addrs.push(sp);
    }
    // Word align; the zero page provides the padding and the sentinel.
    sp &= !3;
    sp -= 4;
    // argv[] with argv[0] lowest.
    for &addr in arg_addrs.iter().rev() {
        sp -= 4;
        usermem::write_user_u32(kernel, proc, sp, addr as u32, Access::User)?;
    }
    let argv = sp;
    sp -= 4;
    usermem::write_user_u32(kernel, proc, sp, argv as u32, Access::User)?;
    sp -= 4;
    usermem::write_user_u32(kernel, proc, sp, args.len() as u32, Access::User)?;
    // Fake return address.
    sp -= 4;
    if sp < stack_page {
        return Err(KernelError::NoSpace);
    }
    proc.set_esp(sp);
    Ok(())
}

/// Waits for child `child` of `parent`: blocks on its completion semaphore,
/// consumes the record, and returns the exit code. Returns -1 when no such
/// un-waited child exists.
pub fn wait(kernel: &Kernel, parent: Tid, child: Tid) -> i32 {
    let record = {
        let records = kernel.procs.records.lock();
        records
            .iter()
            .find(|r| r.parent_tid == parent && r.tid == child)
            .cloned()
    };
    let Some(record) = record else {
        return -1;
    };
    record.sema.down();
    kernel
        .procs
        .records
        .lock()
        .retain(|r| !Arc::ptr_eq(r, &record));
    record.exit_code()
}

/// Releases everything the process holds and settles the record tree:
/// finished children are freed, live children learn their parent is gone,
/// and the process's own record is freed or marked finished depending on
/// whether the parent still runs.
pub fn process_exit(kernel: &Kernel, proc: &Arc<Process>) {
    // Close every open file and directory.
    proc.files.lock().clear();

    // Unmap every mapping, writing dirty pages back through file I/O.
    let regions: Vec<MmapRegion> = proc.mmaps.lock().drain(..).collect();
    for region in &regions {
        syscall::munmap_region(kernel, proc, region);
    }

    // Free the supplemental page table: swap slots, frames, sharing.
    kernel.vm.free_all(&proc.supp);

    let mut finished_record = None;
    {
        let mut records = kernel.procs.records.lock();
        records.retain(|record| {
            if record.parent_tid == proc.tid {
                let mut state = record.state.lock();
                if state.finished {
                    false
                } else {
                    state.parent_finished = true;
                    true
                }
            } else if record.tid == proc.tid {
                let mut state = record.state.lock();
                if state.parent_finished {
                    false
                } else {
                    state.finished = true;
                    finished_record = Some(Arc::clone(record));
                    true
                }
            } else {
                true
            }
        });
    }

    if let Some(record) = finished_record {
        // Drop the executable handle, re-allowing writes to the image.
        *proc.executable.lock() = None;
        let line = format!("{}: exit({})\n", proc.name, record.exit_code());
        kernel.console.putbuf(line.as_bytes());
        log::info!("{}: exit({})", proc.name, record.exit_code());
        record.sema.up();
    }
    kernel.procs.procs.lock().remove(&proc.tid);
}

/// Runs `body` as the initial process (no parent, no executable image, root
/// as current directory) and blocks until it exits. Returns the exit code.
pub fn run_init<F>(kernel: &Arc<Kernel>, name: &str, body: F) -> i32
where
    F: FnOnce(&UserCtx) -> i32 + Send + 'static,
{
    let tid = kernel.procs.alloc_tid();
    let proc = Process::new(tid, name.to_string(), 0, ROOT_DIR_SECTOR);
    let record = ProcRecord::new(tid, 0);
    kernel.procs.records.lock().push(Arc::clone(&record));
    kernel.procs.procs.lock().insert(tid, Arc::clone(&proc));
    proc.supp
        .insert_zero(PHYS_BASE - PAGE_SIZE, Arc::clone(&proc.pd))
        .expect("init stack page");

    let thread = {
        let kernel = Arc::clone(kernel);
        let proc = Arc::clone(&proc);
        let record = Arc::clone(&record);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_user_body(&kernel, &proc, &record, body))
            .expect("spawning init failed")
    };
    kernel.procs.threads.lock().push(thread);

    record.sema.down();
    let code = record.exit_code();
    kernel
        .procs
        .records
        .lock()
        .retain(|r| !Arc::ptr_eq(r, &record));
    code
}

/// The view a user program body has of its process: a simulated stack
/// pointer, loads and stores that go through the paging path, and the
/// syscall surface with arguments passed on the user stack.
pub struct UserCtx {
    pub kernel: Arc<Kernel>,
    pub proc: Arc<Process>,
    sp: Cell<usize>,
}

impl UserCtx {
    pub(crate) fn new(kernel: Arc<Kernel>, proc: Arc<Process>) -> Self {
        let sp = proc.esp();
        Self {
            kernel,
            proc,
            sp: Cell::new(sp),
        }
    }

    pub fn sp(&self) -> usize {
        self.sp.get()
    }

    pub fn set_sp(&self, sp: usize) {
        self.sp.set(sp);
    }

    /// A user-mode store; a protection violation kills the process. The
    /// simulated stack pointer is published first, as the trap frame's
    /// `esp` would be on a real fault.
    pub fn poke(&self, va: usize, bytes: &[u8]) {
        self.proc.set_esp(self.sp.get());
        if usermem::copy_to_user(&self.kernel, &self.proc, va, bytes, Access::User).is_err() {
            kill_current();
        }
    }

    /// A user-mode load; a protection violation kills the process.
    pub fn peek(&self, va: usize, len: usize) -> Vec<u8> {
        self.proc.set_esp(self.sp.get());
        let mut buf = vec![0u8; len];
        if usermem::copy_from_user(&self.kernel, &self.proc, va, &mut buf, Access::User).is_err() {
            kill_current();
        }
        buf
    }

    pub fn poke_u32(&self, va: usize, value: u32) {
        self.poke(va, &value.to_le_bytes());
    }

    pub fn peek_u32(&self, va: usize) -> u32 {
        u32::from_le_bytes(self.peek(va, 4).try_into().unwrap())
    }

    /// Pushes bytes onto the stack and returns their address. The stack
    /// pointer moves before the store, as a push does.
    pub fn push_bytes(&self, bytes: &[u8]) -> usize {
        let sp = self.sp.get() - bytes.len();
        self.sp.set(sp);
        self.poke(sp, bytes);
        sp
    }

    /// Pushes a NUL-terminated string and returns its address.
    pub fn push_str(&self, s: &str) -> usize {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_bytes(&bytes)
    }

    /// Traps into the kernel: the call number and arguments are written to
    /// the user stack and the dispatcher is entered with the trapped stack
    /// pointer. The stack pointer is restored afterwards.
    pub fn syscall(&self, nr: syscall::SyscallNr, args: &[u32]) -> i32 {
        let saved = self.sp.get();
        let sp = saved - 4 * (args.len() + 1);
        self.sp.set(sp);
        self.poke_u32(sp, nr as u32);
        for (i, &arg) in args.iter().enumerate() {
            self.poke_u32(sp + 4 * (i + 1), arg);
        }
        let ret = syscall::handler(&self.kernel, &self.proc, sp);
        self.sp.set(saved);
        ret
    }

    // The user-library wrappers over the raw trap.

    pub fn halt(&self) -> ! {
        self.syscall(syscall::SyscallNr::Halt, &[]);
        unreachable!("halt returned")
    }

    pub fn exit(&self, status: i32) -> ! {
        self.syscall(syscall::SyscallNr::Exit, &[status as u32]);
        unreachable!("exit returned")
    }

    pub fn exec(&self, cmdline: &str) -> i32 {
        let saved = self.sp.get();
        let va = self.push_str(cmdline);
        let ret = self.syscall(syscall::SyscallNr::Exec, &[va as u32]);
        self.sp.set(saved);
        ret
    }

    pub fn wait(&self, tid: i32) -> i32 {
        self.syscall(syscall::SyscallNr::Wait, &[tid as u32])
    }

    pub fn create(&self, path: &str, size: u32) -> bool {
        let saved = self.sp.get();
        let va = self.push_str(path);
        let ret = self.syscall(syscall::SyscallNr::Create, &[va as u32, size]);
        self.sp.set(saved);
        ret != 0
    }

    pub fn remove(&self, path: &str) -> bool {
        let saved = self.sp.get();
        let va = self.push_str(path);
        let ret = self.syscall(syscall::SyscallNr::Remove, &[va as u32]);
        self.sp.set(saved);
        ret != 0
    }

    pub fn open(&self, path: &str) -> i32 {
        let saved = self.sp.get();
        let va = self.push_str(path);
        let ret = self.syscall(syscall::SyscallNr::Open, &[va as u32]);
        self.sp.set(saved);
        ret
    }

    pub fn filesize(&self, fd: i32) -> i32 {
        self.syscall(syscall::SyscallNr::Filesize, &[fd as u32])
    }

    pub fn read(&self, fd: i32, va: usize, len: usize) -> i32 {
        self.syscall(syscall::SyscallNr::Read, &[fd as u32, va as u32, len as u32])
    }

    pub fn write(&self, fd: i32, va: usize, len: usize) -> i32 {
        self.syscall(
            syscall::SyscallNr::Write,
            &[fd as u32, va as u32, len as u32],
        )
    }

    pub fn seek(&self, fd: i32, pos: u32) {
        self.syscall(syscall::SyscallNr::Seek, &[fd as u32, pos]);
    }

    pub fn tell(&self, fd: i32) -> i32 {
        self.syscall(syscall::SyscallNr::Tell, &[fd as u32])
    }

    pub fn close(&self, fd: i32) {
        self.syscall(syscall::SyscallNr::Close, &[fd as u32]);
    }

    pub fn mmap(&self, fd: i32, va: usize) -> i32 {
        self.syscall(syscall::SyscallNr::Mmap, &[fd as u32, va as u32])
    }

    pub fn munmap(&self, mapid: i32) {
        self.syscall(syscall::SyscallNr::Munmap, &[mapid as u32]);
    }

    pub fn chdir(&self, path: &str) -> bool {
        let saved = self.sp.get();
        let va = self.push_str(path);
        let ret = self.syscall(syscall::SyscallNr::Chdir, &[va as u32]);
        self.sp.set(saved);
        ret != 0
    }

    pub fn mkdir(&self, path: &str) -> bool {
        let saved = self.sp.get();
        let va = self.push_str(path);
        let ret = self.syscall(syscall::SyscallNr::Mkdir, &[va as u32]);
        self.sp.set(saved);
        ret != 0
    }

    /// Reads the next directory entry name into `name_va`.
    pub fn readdir(&self, fd: i32, name_va: usize) -> bool {
        self.syscall(syscall::SyscallNr::Readdir, &[fd as u32, name_va as u32]) != 0
    }

    pub fn isdir(&self, fd: i32) -> bool {
        self.syscall(syscall::SyscallNr::Isdir, &[fd as u32]) != 0
    }

    pub fn inumber(&self, fd: i32) -> i32 {
        self.syscall(syscall::SyscallNr::Inumber, &[fd as u32])
    }
}
