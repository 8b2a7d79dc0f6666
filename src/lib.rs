//! Core kernel subsystems of a teaching-grade uniprocessor operating
//! system, simulated on the host so every invariant is testable under
//! `cargo test`:
//!
//! * a buffered block cache with clock eviction, read-ahead, and periodic
//!   write-behind ([`bio`]);
//! * an indexed file layout over that cache with a hierarchical directory
//!   tree on top ([`fs`]);
//! * demand-paged virtual memory: supplemental page tables, a shared frame
//!   table with clock eviction, a swap allocator, memory-mapped files, and
//!   read-only executable sharing ([`vm`]);
//! * the process layer's system-call surface with validated user pointers,
//!   per-process file and mapping tables, and parent/child exit
//!   synchronization ([`proc`]).
//!
//! Start at [`Kernel::boot`].

pub mod bio;
pub mod console;
pub mod dev;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod lock;
pub mod param;
pub mod proc;
pub mod vm;

pub use error::{KernelError, Result};
pub use kernel::{BootConfig, Kernel};
