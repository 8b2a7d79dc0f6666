//! File objects.
//!
//! A `File` pairs an open inode with a private position. Positions are not
//! shared between handles: re-opening yields an independent cursor over the
//! same inode, which is what the mapping layer relies on for memory-mapped
//! files.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::dev::SectorId;
use crate::error::{KernelError, Result};
use crate::fs::inode::InodeRef;

pub struct File {
    inode: InodeRef,
    pos: Mutex<u32>,
    /// Whether this handle holds a deny-write on the inode.
    denied: AtomicBool,
}

impl File {
    /// Opens `inode` as a file.
    pub fn open(inode: InodeRef) -> Result<Self> {
        if inode.is_dir() {
            return Err(KernelError::IsDirectory);
        }
        Ok(Self {
            inode,
            pos: Mutex::new(0),
            denied: AtomicBool::new(false),
        })
    }

    /// Opens a new handle on the same inode with an independent position.
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: Mutex::new(0),
            denied: AtomicBool::new(false),
        }
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    pub fn inumber(&self) -> SectorId {
        self.inode.sector
    }

    pub fn len(&self) -> u32 {
        self.inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode.is_empty()
    }

    /// Reads from the current position, advancing it by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.read_at(buf, *pos);
        *pos += n as u32;
        n
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.write_at(buf, *pos);
        *pos += n as u32;
        n
    }

    /// Reads at an explicit offset without touching the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        self.inode.read_at(buf, offset)
    }

    /// Writes at an explicit offset without touching the position.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        self.inode.write_at(buf, offset)
    }

    pub fn seek(&self, pos: u32) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> u32 {
        *self.pos.lock()
    }

    /// Marks the backing inode write-denied for the lifetime of this handle.
    /// Idempotent per handle.
    pub fn deny_write(&self) {
        if !self.denied.swap(true, Ordering::SeqCst) {
            self.inode.deny_write();
        }
    }

    /// Drops this handle's deny-write early. Idempotent.
    pub fn allow_write(&self) {
        if self.denied.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
