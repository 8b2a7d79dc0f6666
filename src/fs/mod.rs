//! File system implementation. Five layers:
//!   + Free map: allocator for raw disk sectors.
//!   + Inodes: indexed files, reading, writing, extension.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Paths: names like /usr/bin/ls for convenient naming.
//!   + Facade: create/open/remove over whole pathnames.
//!
//! The facade mutex serializes metadata operations that cross inodes
//! (creation, removal, renames of the current-directory binding). Plain
//! reads and writes of file content deliberately bypass it and rely on the
//! inode and cache layers' own locking.

pub mod dir;
pub mod file;
pub mod freemap;
pub mod inode;
pub mod path;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bio::BlockCache;
use crate::dev::{BlockDevice, SectorId};
use crate::error::{KernelError, Result};
use crate::param::ROOT_DIR_SECTOR;
use dir::Dir;
use file::File;
use freemap::FreeMap;
use inode::Itable;

/// Result of opening a path: a file or a directory.
#[derive(Clone)]
pub enum FsObject {
    File(Arc<File>),
    Dir(Arc<Dir>),
}

pub struct Filesys {
    pub cache: Arc<BlockCache>,
    pub freemap: Arc<FreeMap>,
    pub itable: Arc<Itable>,
    meta: Mutex<()>,
}

impl Filesys {
    /// Mounts the filesystem on `dev`, formatting it first when `format` is
    /// set, and starts the cache workers.
    pub fn mount(dev: Arc<dyn BlockDevice>, format: bool) -> Arc<Self> {
        let sectors = dev.sector_count();
        let cache = Arc::new(BlockCache::new(dev));
        cache.start_workers();
        let freemap = Arc::new(FreeMap::open(Arc::clone(&cache)));
        let itable = Itable::new(Arc::clone(&cache), Arc::clone(&freemap));
        if format {
            log::info!("formatting file system ({} sectors)", sectors);
            freemap.format(sectors);
            Dir::create(&itable, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR, 16)
                .expect("root directory creation failed");
        }
        Arc::new(Self {
            cache,
            freemap,
            itable,
            meta: Mutex::new(()),
        })
    }

    /// Writes any unwritten data to disk and stops the cache workers.
    pub fn shutdown(&self) {
        self.cache.stop();
    }

    /// Creates a file named by `path` with `size` bytes of zeroed content.
    pub fn create(&self, path: &str, size: u32, cwd: SectorId) -> Result<()> {
        let _facade = self.meta.lock();
        if path.ends_with('/') {
            return Err(KernelError::InvalidPath);
        }
        let (dir, name) = path::parse(&self.itable, path, cwd)?;
        if dir.inode().is_removed() {
            return Err(KernelError::NotFound);
        }
        let sector = self.freemap.allocate(1)?;
        if let Err(err) = self.itable.create(sector, size, false) {
            self.freemap.release(sector, 1);
            return Err(err);
        }
        if let Err(err) = dir.add(name, sector) {
            self.discard_inode(sector);
            return Err(err);
        }
        Ok(())
    }

    /// Opens the file or directory named by `path`.
    pub fn open(&self, path: &str, cwd: SectorId) -> Result<FsObject> {
        let _facade = self.meta.lock();
        let (dir, name) = path::parse(&self.itable, path, cwd)?;
        if dir.inode().is_removed() {
            return Err(KernelError::NotFound);
        }
        let sector = dir.lookup(name).ok_or(KernelError::NotFound)?;
        let inode = self.itable.open(sector)?;
        if inode.is_dir() {
            Ok(FsObject::Dir(Arc::new(Dir::open(inode)?)))
        } else {
            if path.ends_with('/') {
                return Err(KernelError::NotDirectory);
            }
            Ok(FsObject::File(Arc::new(File::open(inode)?)))
        }
    }

    /// Opens `path` as a plain file.
    pub fn open_file(&self, path: &str, cwd: SectorId) -> Result<Arc<File>> {
        match self.open(path, cwd)? {
            FsObject::File(file) => Ok(file),
            FsObject::Dir(_) => Err(KernelError::IsDirectory),
        }
    }

    /// Deletes the file or directory named by `path`. A directory must be
    /// empty, and neither `.` nor `..` nor any sector in `protected` (nor an
    /// ancestor of one) may be removed.
    pub fn remove(&self, path: &str, cwd: SectorId, protected: &[SectorId]) -> Result<()> {
        let _facade = self.meta.lock();
        let (dir, name) = path::parse(&self.itable, path, cwd)?;
        if name == "." || name == ".." {
            return Err(KernelError::InvalidPath);
        }
        let sector = dir.lookup(name).ok_or(KernelError::NotFound)?;
        let inode = self.itable.open(sector)?;
        for &below in protected {
            if self.is_ancestor(sector, below)? {
                return Err(KernelError::InUse);
            }
        }
        if inode.is_dir() {
            let target = Dir::open(inode.clone())?;
            if target.entry_count() > 2 {
                return Err(KernelError::DirectoryNotEmpty);
            }
        } else if path.ends_with('/') {
            return Err(KernelError::NotDirectory);
        }
        dir.remove(&self.itable, name)
    }

    /// Creates an empty directory named by `path`.
    pub fn mkdir(&self, path: &str, cwd: SectorId) -> Result<()> {
        let _facade = self.meta.lock();
        let (dir, name) = path::parse(&self.itable, path, cwd)?;
        if dir.inode().is_removed() {
            return Err(KernelError::NotFound);
        }
        let parent_sector = dir.inumber();
        let sector = self.freemap.allocate(1)?;
        if let Err(err) = Dir::create(&self.itable, sector, parent_sector, 0) {
            self.discard_inode(sector);
            return Err(err);
        }
        if let Err(err) = dir.add(name, sector) {
            self.discard_inode(sector);
            return Err(err);
        }
        Ok(())
    }

    /// Resolves `path` to a directory sector, for binding as a process's
    /// current directory.
    pub fn chdir_lookup(&self, path: &str, cwd: SectorId) -> Result<SectorId> {
        let _facade = self.meta.lock();
        let (dir, name) = path::parse(&self.itable, path, cwd)?;
        let sector = dir.lookup(name).ok_or(KernelError::NotFound)?;
        let inode = self.itable.open(sector)?;
        if !inode.is_dir() || inode.is_removed() {
            return Err(KernelError::NotDirectory);
        }
        Ok(sector)
    }

    /// True when `candidate` is `below` or an ancestor of `below` in the
    /// directory tree.
    fn is_ancestor(&self, candidate: SectorId, below: SectorId) -> Result<bool> {
        let mut cur = below;
        loop {
            if cur == candidate {
                return Ok(true);
            }
            if cur == ROOT_DIR_SECTOR {
                return Ok(false);
            }
            let dir = Dir::open(self.itable.open(cur)?)?;
            match dir.lookup("..") {
                Some(parent) if parent != cur => cur = parent,
                _ => return Ok(false),
            }
        }
    }

    /// Frees a half-created inode and its content after a failed creation.
    fn discard_inode(&self, sector: SectorId) {
        match self.itable.open(sector) {
            Ok(inode) => inode.mark_removed(),
            Err(_) => self.freemap.release(sector, 1),
        }
    }
}
