//! Shared test scaffolding.
#![allow(dead_code)]

use std::sync::Arc;

use minos_kernel::param::ROOT_DIR_SECTOR;
use minos_kernel::proc::UserCtx;
use minos_kernel::{BootConfig, Kernel};

pub fn boot() -> Arc<Kernel> {
    boot_with_frames(64)
}

pub fn boot_with_frames(frames: usize) -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::boot(BootConfig {
        frames,
        ..BootConfig::default()
    })
}

/// A deterministic content byte for offset `i`.
pub fn pattern(i: usize) -> u8 {
    (i.wrapping_mul(7) % 251) as u8
}

/// Creates an executable file named `name` with `len` pattern bytes and
/// registers `body` as the program behind it.
pub fn install_program<F>(kernel: &Arc<Kernel>, name: &str, len: usize, body: F)
where
    F: Fn(&UserCtx) -> i32 + Send + Sync + 'static,
{
    kernel.fs.create(name, 0, ROOT_DIR_SECTOR).unwrap();
    let file = kernel.fs.open_file(name, ROOT_DIR_SECTOR).unwrap();
    let bytes: Vec<u8> = (0..len).map(pattern).collect();
    assert_eq!(file.write_at(&bytes, 0), len);
    kernel.register_program(name, body);
}

/// Reads argc/argv off the initial user stack.
pub fn argv(ctx: &UserCtx) -> Vec<String> {
    let sp = ctx.sp();
    let argc = ctx.peek_u32(sp + 4) as usize;
    let argv_base = ctx.peek_u32(sp + 8) as usize;
    (0..argc)
        .map(|i| {
            let ptr = ctx.peek_u32(argv_base + 4 * i) as usize;
            let mut bytes = Vec::new();
            let mut off = 0;
            loop {
                let byte = ctx.peek(ptr + off, 1)[0];
                if byte == 0 {
                    break;
                }
                bytes.push(byte);
                off += 1;
            }
            String::from_utf8(bytes).unwrap()
        })
        .collect()
}
