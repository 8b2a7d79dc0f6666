//! Directories.
//!
//! A directory is an inode whose content is a packed sequence of fixed-size
//! entries. Every directory carries the implicit entries `.` and `..`,
//! written at construction time with `..` naming the parent's inode sector.
//! Removal clears an entry's in-use flag without compacting the file; adding
//! reuses the first free slot and extends the directory by one entry when
//! none is free. Each directory is serialized by its inode's directory lock.

use std::sync::Arc;

use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::dev::SectorId;
use crate::error::{KernelError, Result};
use crate::fs::inode::{InodeRef, Itable};
use crate::param::NAME_MAX;

/// Size of one on-disk directory entry.
pub const DIRENT_SIZE: usize = 20;

/// On-disk directory entry: a sector, a NUL-terminated name, an in-use flag.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct Dirent {
    sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const_assert_eq!(core::mem::size_of::<Dirent>(), DIRENT_SIZE);

impl Dirent {
    fn free() -> Self {
        Self {
            sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    /// Fill in name. `name` must be at most `NAME_MAX` bytes.
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name = [0; NAME_MAX + 1];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    /// Returns the slice that exactly contains the name.
    fn get_name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&ch| ch == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }

    fn name_is(&self, name: &str) -> bool {
        self.get_name() == name.as_bytes()
    }
}

/// An open directory: a directory inode plus a read cursor.
pub struct Dir {
    inode: InodeRef,
    pos: Mutex<u32>,
}

impl Dir {
    /// Opens `inode` as a directory.
    pub fn open(inode: InodeRef) -> Result<Self> {
        if !inode.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        Ok(Self {
            inode,
            pos: Mutex::new(0),
        })
    }

    /// Creates a directory with room for `entry_cnt` entries (plus `.` and
    /// `..`) in `sector`, whose parent lives at `parent_sector`.
    pub fn create(
        itable: &Arc<Itable>,
        sector: SectorId,
        parent_sector: SectorId,
        entry_cnt: usize,
    ) -> Result<()> {
        let length = ((entry_cnt + 2) * DIRENT_SIZE) as u32;
        itable.create(sector, length, true)?;
        let dir = Dir::open(itable.open(sector)?)?;
        dir.add(".", sector)?;
        dir.add("..", parent_sector)?;
        Ok(())
    }

    /// Opens a new handle on the same inode, with a fresh cursor.
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: Mutex::new(0),
        }
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    pub fn inumber(&self) -> SectorId {
        self.inode.sector
    }

    fn entry_at(&self, ofs: u32) -> Option<Dirent> {
        let mut buf = [0u8; DIRENT_SIZE];
        if self.inode.read_at(&mut buf, ofs) != DIRENT_SIZE {
            return None;
        }
        Some(*LayoutVerified::<_, Dirent>::new(&buf[..]).expect("dirent size"))
    }

    fn write_entry_at(&self, ofs: u32, entry: &Dirent) -> Result<()> {
        if self.inode.write_at(entry.as_bytes(), ofs) != DIRENT_SIZE {
            return Err(KernelError::NoSpace);
        }
        Ok(())
    }

    fn scan(&self, name: &str) -> Option<(Dirent, u32)> {
        let mut ofs = 0;
        while let Some(entry) = self.entry_at(ofs) {
            if entry.in_use != 0 && entry.name_is(name) {
                return Some((entry, ofs));
            }
            ofs += DIRENT_SIZE as u32;
        }
        None
    }

    /// Looks `name` up, returning the sector of its inode.
    pub fn lookup(&self, name: &str) -> Option<SectorId> {
        let _guard = self.inode.dir_lock.lock();
        self.scan(name).map(|(entry, _)| entry.sector)
    }

    /// Adds an entry binding `name` to `inode_sector`. The name must not
    /// already be present; the first free slot is reused, and the directory
    /// grows by one entry when every slot is taken.
    pub fn add(&self, name: &str, inode_sector: SectorId) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        let _guard = self.inode.dir_lock.lock();
        if self.scan(name).is_some() {
            return Err(KernelError::AlreadyExists);
        }

        // Falling off the end leaves `ofs` at end-of-file, which extends the
        // directory by one entry.
        let mut ofs = 0;
        while let Some(entry) = self.entry_at(ofs) {
            if entry.in_use == 0 {
                break;
            }
            ofs += DIRENT_SIZE as u32;
        }

        let mut entry = Dirent::free();
        entry.in_use = 1;
        entry.set_name(name);
        entry.sector = inode_sector;
        self.write_entry_at(ofs, &entry)
    }

    /// Removes the entry for `name` and marks its inode for deletion on the
    /// last close.
    pub fn remove(&self, itable: &Arc<Itable>, name: &str) -> Result<()> {
        let _guard = self.inode.dir_lock.lock();
        let (mut entry, ofs) = self.scan(name).ok_or(KernelError::NotFound)?;
        let target = itable.open(entry.sector)?;
        entry.in_use = 0;
        self.write_entry_at(ofs, &entry)?;
        target.mark_removed();
        Ok(())
    }

    /// Returns the next entry name after the cursor, skipping `.` and `..`
    /// and free slots.
    pub fn read_next(&self) -> Option<String> {
        let mut pos = self.pos.lock();
        let _guard = self.inode.dir_lock.lock();
        while let Some(entry) = self.entry_at(*pos) {
            *pos += DIRENT_SIZE as u32;
            if entry.in_use != 0 && !entry.name_is(".") && !entry.name_is("..") {
                return Some(String::from_utf8_lossy(entry.get_name()).into_owned());
            }
        }
        None
    }

    /// Number of in-use entries, `.` and `..` included.
    pub fn entry_count(&self) -> usize {
        let _guard = self.inode.dir_lock.lock();
        let mut count = 0;
        let mut ofs = 0;
        while let Some(entry) = self.entry_at(ofs) {
            if entry.in_use != 0 {
                count += 1;
            }
            ofs += DIRENT_SIZE as u32;
        }
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dirent_name_roundtrip() {
        let mut entry = Dirent::free();
        entry.set_name("a-long-name.ok");
        assert!(entry.name_is("a-long-name.ok"));
        assert!(!entry.name_is("a-long-name.o"));
        entry.set_name("x");
        assert!(entry.name_is("x"));
    }
}
