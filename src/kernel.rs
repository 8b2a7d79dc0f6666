//! The kernel object.
//!
//! One `Kernel` owns every subsystem singleton: devices, the block cache and
//! filesystem, the virtual-memory tables, the process table, the console,
//! and the program registry that stands in for an on-disk loader's entry
//! points. Construct one with [`Kernel::boot`]; tear it down with
//! [`Kernel::shutdown`], which flushes the cache and joins the workers.

use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use crate::console::Console;
use crate::dev::{BlockDevice, MemDisk};
use crate::fs::Filesys;
use crate::proc::{self, ExitCall, Halted, Killed, ProcTable, UserCtx};
use crate::vm::Vm;

/// A user program's entry point.
pub type Program = Arc<dyn Fn(&UserCtx) -> i32 + Send + Sync>;

pub struct BootConfig {
    pub fs_sectors: u32,
    pub swap_sectors: u32,
    pub frames: usize,
    pub format: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            fs_sectors: 2048,
            swap_sectors: 512,
            frames: 64,
            format: true,
        }
    }
}

pub struct Kernel {
    pub fs_dev: Arc<MemDisk>,
    pub swap_dev: Arc<MemDisk>,
    pub fs: Arc<Filesys>,
    pub vm: Vm,
    pub procs: ProcTable,
    pub console: Console,
    programs: Mutex<HashMap<String, Program>>,
    halted: AtomicBool,
}

/// Keeps kernel-initiated unwinds (kills, exits, halt) out of the panic
/// output while leaving genuine panics visible.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            if payload.is::<Killed>() || payload.is::<ExitCall>() || payload.is::<Halted>() {
                return;
            }
            default(info);
        }));
    });
}

impl Kernel {
    pub fn boot(cfg: BootConfig) -> Arc<Self> {
        let fs_dev = Arc::new(MemDisk::new(cfg.fs_sectors));
        let swap_dev = Arc::new(MemDisk::new(cfg.swap_sectors));
        Self::boot_with_devices(fs_dev, swap_dev, cfg)
    }

    /// Boots on existing devices, which lets a test shut down and re-mount
    /// the same disk.
    pub fn boot_with_devices(
        fs_dev: Arc<MemDisk>,
        swap_dev: Arc<MemDisk>,
        cfg: BootConfig,
    ) -> Arc<Self> {
        install_panic_hook();
        let fs = Filesys::mount(Arc::clone(&fs_dev) as Arc<dyn BlockDevice>, cfg.format);
        let vm = Vm::new(cfg.frames, Arc::clone(&swap_dev) as Arc<dyn BlockDevice>);
        log::info!(
            "kernel up: {} fs sectors, {} swap sectors, {} frames",
            fs_dev.sector_count(),
            swap_dev.sector_count(),
            cfg.frames
        );
        Arc::new(Self {
            fs_dev,
            swap_dev,
            fs,
            vm,
            procs: ProcTable::new(),
            console: Console::new(),
            programs: Mutex::new(HashMap::new()),
            halted: AtomicBool::new(false),
        })
    }

    /// Registers a named program body; `exec` resolves its first token here
    /// and maps the equally named executable file from the filesystem.
    pub fn register_program<F>(&self, name: &str, body: F)
    where
        F: Fn(&UserCtx) -> i32 + Send + Sync + 'static,
    {
        self.programs.lock().insert(name.to_string(), Arc::new(body));
    }

    pub fn program(&self, name: &str) -> Option<Program> {
        self.programs.lock().get(name).cloned()
    }

    /// Runs `body` as the initial process and returns its exit code.
    pub fn run_init<F>(self: &Arc<Self>, name: &str, body: F) -> i32
    where
        F: FnOnce(&UserCtx) -> i32 + Send + 'static,
    {
        proc::run_init(self, name, body)
    }

    /// Powers the machine down: best-effort flush, then no further activity.
    pub fn halt(&self) {
        log::info!("halt");
        self.halted.store(true, Ordering::SeqCst);
        self.fs.shutdown();
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Flushes everything and joins process and cache workers. Processes
    /// are expected to have exited.
    pub fn shutdown(&self) {
        self.procs.join_all();
        self.fs.shutdown();
    }
}
