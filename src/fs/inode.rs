//! Inodes.
//!
//! An inode describes a single unnamed file or directory: its length and the
//! index of sectors holding its content, 12 direct slots plus one
//! single-indirect and one double-indirect block. The on-disk inode occupies
//! exactly one sector.
//!
//! The kernel keeps a table of open inodes in memory so that opening the same
//! sector twice yields the same in-memory object; the table is a list guarded
//! by a single lock, and an entry leaves the list when its open count drops
//! to zero. A removed inode gives back every data sector, every index block,
//! and its own sector when the last opener closes it.
//!
//! Two locks hang off each open inode. The *extend* lock serializes
//! file-growing writes. The *directory* lock belongs to the directory layer
//! and serializes entry operations on directory inodes. Readers are never
//! blocked by an in-progress extension: they are bounded by
//! `max_read_length`, which the extending writer publishes only after the
//! written data is in place, so a reader can never observe an
//! extended-but-incomplete tail.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::BlockCache;
use crate::dev::SectorId;
use crate::error::{KernelError, Result};
use crate::fs::freemap::FreeMap;
use crate::param::{INODE_MAGIC, NDIRECT, NINDIRECT, SECTOR_SIZE};

/// Largest block number an inode can address, exclusive.
pub const MAX_BLOCKS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Returns the number of sectors needed for `len` bytes of content.
pub const fn bytes_to_sectors(len: u32) -> u32 {
    len.div_ceil(SECTOR_SIZE as u32)
}

/// On-disk inode structure. Exactly one sector.
///
/// The runtime bookkeeping fields (`open_cnt`, `removed`, `deny_write_cnt`,
/// `length_max`) are persisted alongside the index but ignored on open.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    pub length: u32,
    pub magic: u32,
    pub open_cnt: u32,
    pub removed: u8,
    pub deny_write_cnt: u32,
    pub length_max: u32,
    pub direct: [u32; NDIRECT],
    pub indirect: u32,
    pub double_indirect: u32,
    pub is_dir: u8,
    _pad: [u8; 434],
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

/// Cached copy of the on-disk index fields.
#[derive(Clone, Copy)]
struct InodeIdx {
    length: u32,
    direct: [u32; NDIRECT],
    indirect: u32,
    double_indirect: u32,
}

struct InodeState {
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// In-memory inode. Obtained through [`Itable::open`]; unique per sector.
pub struct Inode {
    pub sector: SectorId,
    is_dir: bool,
    cache: Arc<BlockCache>,
    freemap: Arc<FreeMap>,
    state: Mutex<InodeState>,
    idx: Mutex<InodeIdx>,
    /// Readers never read at or beyond this offset. The extending writer
    /// publishes the new value only after the tail's data is written.
    max_read: AtomicU32,
    extend_lock: Mutex<()>,
    /// Serializes directory-level operations; owned by the directory layer.
    pub(crate) dir_lock: Mutex<()>,
}

fn decode_index(buf: &[u8; SECTOR_SIZE]) -> [u32; NINDIRECT] {
    let mut entries = [0u32; NINDIRECT];
    for (entry, chunk) in entries.iter_mut().zip(buf.chunks_exact(4)) {
        *entry = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    entries
}

fn encode_index(buf: &mut [u8; SECTOR_SIZE], entries: &[u32; NINDIRECT]) {
    for (chunk, entry) in buf.chunks_exact_mut(4).zip(entries.iter()) {
        chunk.copy_from_slice(&entry.to_le_bytes());
    }
}

fn nonzero(sector: u32) -> Option<SectorId> {
    (sector != 0).then_some(sector)
}

impl Inode {
    fn from_disk(
        cache: Arc<BlockCache>,
        freemap: Arc<FreeMap>,
        sector: SectorId,
        d: &DiskInode,
    ) -> Self {
        Self {
            sector,
            is_dir: d.is_dir != 0,
            cache,
            freemap,
            state: Mutex::new(InodeState {
                open_cnt: 0,
                removed: false,
                deny_write_cnt: 0,
            }),
            idx: Mutex::new(InodeIdx {
                length: d.length,
                direct: d.direct,
                indirect: d.indirect,
                double_indirect: d.double_indirect,
            }),
            max_read: AtomicU32::new(d.length),
            extend_lock: Mutex::new(()),
            dir_lock: Mutex::new(()),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Marks the inode to be deleted when the last opener closes it.
    pub fn mark_removed(&self) {
        self.state.lock().removed = true;
    }

    /// Length, in bytes, of the inode's data.
    pub fn len(&self) -> u32 {
        self.idx.lock().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        debug_assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// Re-enables writes; pairs with one earlier `deny_write`.
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        state.deny_write_cnt -= 1;
    }

    fn read_index_block(&self, sector: SectorId) -> [u32; NINDIRECT] {
        self.cache.with_read(sector, decode_index)
    }

    fn write_index_block(&self, sector: SectorId, entries: &[u32; NINDIRECT]) {
        self.cache.with_write(sector, |buf| encode_index(buf, entries));
    }

    /// Returns the device sector containing byte `pos`, or `None` when `pos`
    /// is at or beyond `limit` or the block is unallocated.
    fn byte_to_sector(&self, pos: u32, limit: u32) -> Option<SectorId> {
        if pos >= limit {
            return None;
        }
        let bn = pos as usize / SECTOR_SIZE;
        let (direct, indirect, double_indirect) = {
            let idx = self.idx.lock();
            (idx.direct, idx.indirect, idx.double_indirect)
        };
        if bn < NDIRECT {
            nonzero(direct[bn])
        } else if bn < NDIRECT + NINDIRECT {
            let entries = self.read_index_block(nonzero(indirect)?);
            nonzero(entries[bn - NDIRECT])
        } else if bn < MAX_BLOCKS {
            let rest = bn - NDIRECT - NINDIRECT;
            let level1 = self.read_index_block(nonzero(double_indirect)?);
            let entries = self.read_index_block(nonzero(level1[rest / NINDIRECT])?);
            nonzero(entries[rest % NINDIRECT])
        } else {
            None
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which stops short at `max_read_length`.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        let mut bytes_read = 0;
        let mut offset = offset;
        while bytes_read < buf.len() {
            let limit = self.max_read.load(Ordering::Acquire);
            if offset >= limit {
                break;
            }
            let sector_ofs = offset as usize % SECTOR_SIZE;
            let inode_left = (limit - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_read).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let sector = match self.byte_to_sector(offset, limit) {
                Some(sector) => sector,
                None => break,
            };
            self.cache.with_read(sector, |data| {
                buf[bytes_read..bytes_read + chunk]
                    .copy_from_slice(&data[sector_ofs..sector_ofs + chunk]);
            });
            bytes_read += chunk;
            offset += chunk as u32;
        }

        // Prime the cache with the sector following the last one touched.
        if bytes_read > 0 {
            let limit = self.max_read.load(Ordering::Acquire);
            if let Some(next) = offset
                .checked_add(SECTOR_SIZE as u32)
                .and_then(|pos| self.byte_to_sector(pos, limit))
            {
                self.cache.read_ahead(next);
            }
        }
        bytes_read
    }

    /// Writes `buf` at `offset`, extending the file first when the range
    /// reaches past the current end. Returns the number of bytes written:
    /// zero when writes are denied or the extension could not be allocated.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        if self.state.lock().deny_write_cnt > 0 {
            return 0;
        }
        let end = match offset.checked_add(buf.len() as u32) {
            Some(end) => end,
            None => return 0,
        };

        // Grow under the extend lock; re-check under it, since a concurrent
        // writer may have grown the file past `end` already.
        let mut extend_guard = None;
        if end > self.max_read.load(Ordering::Acquire) {
            let guard = self.extend_lock.lock();
            if end > self.max_read.load(Ordering::Acquire) {
                let cur_len = self.idx.lock().length;
                let add = bytes_to_sectors(end) - bytes_to_sectors(cur_len);
                if add > 0 {
                    if let Err(err) = self.extend(add) {
                        log::debug!("inode {}: extension failed: {}", self.sector, err);
                        return 0;
                    }
                }
                self.idx.lock().length = end;
                extend_guard = Some(guard);
            }
        }

        let mut bytes_written = 0;
        let mut offset = offset;
        while bytes_written < buf.len() {
            let length = self.idx.lock().length;
            let sector_ofs = offset as usize % SECTOR_SIZE;
            if offset >= length {
                break;
            }
            let inode_left = (length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let sector = match self.byte_to_sector(offset, length) {
                Some(sector) => sector,
                None => break,
            };
            self.cache.with_write(sector, |data| {
                data[sector_ofs..sector_ofs + chunk]
                    .copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
            });
            bytes_written += chunk;
            offset += chunk as u32;
        }

        if bytes_written > 0 {
            let length = self.idx.lock().length;
            if let Some(next) = offset
                .checked_add(SECTOR_SIZE as u32)
                .and_then(|pos| self.byte_to_sector(pos, length))
            {
                self.cache.read_ahead(next);
            }
        }

        // Only now may concurrent readers see the extended tail.
        if extend_guard.is_some() {
            self.max_read
                .store(self.idx.lock().length, Ordering::Release);
            self.persist();
        }
        bytes_written
    }

    fn zero_sector(&self, sector: SectorId) {
        self.cache.with_write(sector, |data| data.fill(0));
    }

    /// Allocates `add` more sectors of content, creating intermediate index
    /// blocks as boundaries are crossed. Index-block buffers are kept in
    /// memory and flushed on boundary crossings or at completion. On
    /// allocation failure every sector taken during this call is released in
    /// reverse order and the index is restored; the inode is left exactly as
    /// it was.
    fn extend(&self, add: u32) -> Result<()> {
        let snap = *self.idx.lock();
        let orig_sectors = bytes_to_sectors(snap.length) as usize;
        let new_sectors = orig_sectors + add as usize;
        if new_sectors > MAX_BLOCKS {
            return Err(KernelError::NoSpace);
        }

        let mut allocated: Vec<SectorId> = Vec::new();
        // (sector, entries) of the indirect block currently being filled.
        let mut ind: Option<(SectorId, [u32; NINDIRECT])> = None;
        let mut dbl: Option<(SectorId, [u32; NINDIRECT])> = None;
        // Pre-call contents of a pre-existing double-indirect block, restored
        // on rollback so that its entries beyond the old length stay zero.
        let mut dbl_snapshot: Option<[u32; NINDIRECT]> = None;

        let result = (|| -> Result<()> {
            for bn in orig_sectors..new_sectors {
                let last = bn == new_sectors - 1;
                if bn < NDIRECT {
                    let sector = self.freemap.allocate(1)?;
                    allocated.push(sector);
                    self.zero_sector(sector);
                    self.idx.lock().direct[bn] = sector;
                } else if bn < NDIRECT + NINDIRECT {
                    let slot = bn - NDIRECT;
                    if ind.is_none() {
                        let existing = self.idx.lock().indirect;
                        if existing == 0 {
                            let sector = self.freemap.allocate(1)?;
                            allocated.push(sector);
                            self.idx.lock().indirect = sector;
                            ind = Some((sector, [0; NINDIRECT]));
                        } else {
                            ind = Some((existing, self.read_index_block(existing)));
                        }
                    }
                    let sector = self.freemap.allocate(1)?;
                    allocated.push(sector);
                    self.zero_sector(sector);
                    let (ind_sector, entries) = ind.as_mut().unwrap();
                    entries[slot] = sector;
                    if last || slot == NINDIRECT - 1 {
                        let (ind_sector, entries) = (*ind_sector, *entries);
                        self.write_index_block(ind_sector, &entries);
                        ind = None;
                    }
                } else {
                    let rest = bn - NDIRECT - NINDIRECT;
                    let (level1, slot) = (rest / NINDIRECT, rest % NINDIRECT);
                    if dbl.is_none() {
                        let existing = self.idx.lock().double_indirect;
                        if existing == 0 {
                            let sector = self.freemap.allocate(1)?;
                            allocated.push(sector);
                            self.idx.lock().double_indirect = sector;
                            dbl = Some((sector, [0; NINDIRECT]));
                        } else {
                            let entries = self.read_index_block(existing);
                            dbl_snapshot = Some(entries);
                            dbl = Some((existing, entries));
                        }
                    }
                    let dbl_entries = &mut dbl.as_mut().unwrap().1;
                    if dbl_entries[level1] == 0 {
                        let sector = self.freemap.allocate(1)?;
                        allocated.push(sector);
                        dbl_entries[level1] = sector;
                        ind = Some((sector, [0; NINDIRECT]));
                    } else if ind.is_none() {
                        let ind_sector = dbl_entries[level1];
                        ind = Some((ind_sector, self.read_index_block(ind_sector)));
                    }
                    let sector = self.freemap.allocate(1)?;
                    allocated.push(sector);
                    self.zero_sector(sector);
                    let (ind_sector, entries) = ind.as_mut().unwrap();
                    entries[slot] = sector;
                    if last || slot == NINDIRECT - 1 {
                        let (ind_sector, entries) = (*ind_sector, *entries);
                        self.write_index_block(ind_sector, &entries);
                        ind = None;
                    }
                    if last {
                        let (dbl_sector, entries) = dbl.as_ref().unwrap();
                        self.write_index_block(*dbl_sector, entries);
                    }
                }
            }
            Ok(())
        })();

        if let Err(err) = result {
            log::debug!(
                "inode {}: rolling back {} sectors after failed extension",
                self.sector,
                allocated.len()
            );
            for &sector in allocated.iter().rev() {
                self.freemap.release(sector, 1);
            }
            let mut idx = self.idx.lock();
            idx.direct = snap.direct;
            idx.indirect = snap.indirect;
            idx.double_indirect = snap.double_indirect;
            drop(idx);
            if let Some(entries) = dbl_snapshot {
                self.write_index_block(snap.double_indirect, &entries);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Writes the inode sector back through the cache.
    pub fn persist(&self) {
        let d = {
            let idx = self.idx.lock();
            let state = self.state.lock();
            DiskInode {
                length: idx.length,
                magic: INODE_MAGIC,
                open_cnt: state.open_cnt,
                removed: state.removed as u8,
                deny_write_cnt: state.deny_write_cnt,
                length_max: self.max_read.load(Ordering::Acquire),
                direct: idx.direct,
                indirect: idx.indirect,
                double_indirect: idx.double_indirect,
                is_dir: self.is_dir as u8,
                _pad: [0; 434],
            }
        };
        self.cache
            .with_write(self.sector, |buf| buf.copy_from_slice(d.as_bytes()));
    }

    /// Gives back every data sector, every index block, the inode's own
    /// sector, and zeroes the inode sector on disk. Runs when the last opener
    /// closes a removed inode.
    fn release_on_disk(&self) {
        let idx = *self.idx.lock();
        let sectors = bytes_to_sectors(idx.length) as usize;

        for bn in 0..sectors.min(NDIRECT) {
            if let Some(sector) = nonzero(idx.direct[bn]) {
                self.freemap.release(sector, 1);
            }
        }
        if let Some(ind_sector) = nonzero(idx.indirect) {
            let entries = self.read_index_block(ind_sector);
            for slot in 0..sectors.saturating_sub(NDIRECT).min(NINDIRECT) {
                if let Some(sector) = nonzero(entries[slot]) {
                    self.freemap.release(sector, 1);
                }
            }
            self.freemap.release(ind_sector, 1);
        }
        if let Some(dbl_sector) = nonzero(idx.double_indirect) {
            let level1 = self.read_index_block(dbl_sector);
            let rest = sectors.saturating_sub(NDIRECT + NINDIRECT);
            for (l1_slot, &ind_sector) in level1.iter().enumerate() {
                let Some(ind_sector) = nonzero(ind_sector) else {
                    continue;
                };
                let entries = self.read_index_block(ind_sector);
                for slot in 0..rest.saturating_sub(l1_slot * NINDIRECT).min(NINDIRECT) {
                    if let Some(sector) = nonzero(entries[slot]) {
                        self.freemap.release(sector, 1);
                    }
                }
                self.freemap.release(ind_sector, 1);
            }
            self.freemap.release(dbl_sector, 1);
        }

        self.zero_sector(self.sector);
        self.freemap.release(self.sector, 1);
        log::debug!("inode {}: released {} content sectors", self.sector, sectors);
    }
}

/// Table of open inodes: at most one in-memory inode per sector.
pub struct Itable {
    cache: Arc<BlockCache>,
    freemap: Arc<FreeMap>,
    list: Mutex<Vec<Arc<Inode>>>,
}

/// A counted reference to an open inode. Cloning reopens; dropping closes,
/// deallocating a removed inode when the last reference goes away.
pub struct InodeRef {
    inode: Arc<Inode>,
    itable: Arc<Itable>,
}

impl core::ops::Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        self.inode.state.lock().open_cnt += 1;
        Self {
            inode: Arc::clone(&self.inode),
            itable: Arc::clone(&self.itable),
        }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        self.itable.close(&self.inode);
    }
}

impl Itable {
    pub fn new(cache: Arc<BlockCache>, freemap: Arc<FreeMap>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            freemap,
            list: Mutex::new(Vec::new()),
        })
    }

    /// Initializes an inode with `length` bytes of zeroed data at `sector`,
    /// which the caller has already allocated. The new inode is persisted but
    /// not opened. On allocation failure nothing is left allocated besides
    /// `sector` itself.
    pub fn create(&self, sector: SectorId, length: u32, is_dir: bool) -> Result<()> {
        let blank = DiskInode {
            length: 0,
            magic: INODE_MAGIC,
            open_cnt: 0,
            removed: 0,
            deny_write_cnt: 0,
            length_max: 0,
            direct: [0; NDIRECT],
            indirect: 0,
            double_indirect: 0,
            is_dir: is_dir as u8,
            _pad: [0; 434],
        };
        let inode = Inode::from_disk(
            Arc::clone(&self.cache),
            Arc::clone(&self.freemap),
            sector,
            &blank,
        );
        inode.extend(bytes_to_sectors(length))?;
        inode.idx.lock().length = length;
        inode.max_read.store(length, Ordering::Release);
        inode.persist();
        Ok(())
    }

    /// Opens the inode at `sector`, returning the existing in-memory inode
    /// when one is already open. The second look-up after reading the disk
    /// resolves the race where two callers open the same un-cached sector:
    /// the loser drops its own allocation and joins the winner's.
    pub fn open(self: &Arc<Self>, sector: SectorId) -> Result<InodeRef> {
        {
            let list = self.list.lock();
            if let Some(inode) = list.iter().find(|inode| inode.sector == sector) {
                inode.state.lock().open_cnt += 1;
                return Ok(InodeRef {
                    inode: Arc::clone(inode),
                    itable: Arc::clone(self),
                });
            }
        }

        let d: DiskInode = self.cache.with_read(sector, |buf| {
            *LayoutVerified::<_, DiskInode>::new(&buf[..]).expect("inode sector size")
        });
        if d.magic != INODE_MAGIC {
            return Err(KernelError::Corrupted("bad inode magic"));
        }
        let inode = Arc::new(Inode::from_disk(
            Arc::clone(&self.cache),
            Arc::clone(&self.freemap),
            sector,
            &d,
        ));

        let mut list = self.list.lock();
        if let Some(other) = list.iter().find(|inode| inode.sector == sector) {
            other.state.lock().open_cnt += 1;
            return Ok(InodeRef {
                inode: Arc::clone(other),
                itable: Arc::clone(self),
            });
        }
        inode.state.lock().open_cnt = 1;
        list.push(Arc::clone(&inode));
        Ok(InodeRef {
            inode,
            itable: Arc::clone(self),
        })
    }

    fn close(&self, inode: &Arc<Inode>) {
        let mut list = self.list.lock();
        let removed = {
            let mut state = inode.state.lock();
            state.open_cnt -= 1;
            if state.open_cnt > 0 {
                return;
            }
            state.removed
        };
        list.retain(|other| !Arc::ptr_eq(other, inode));
        drop(list);
        if removed {
            inode.release_on_disk();
        }
    }

    /// Number of open inodes, for inspection by tests.
    pub fn open_count(&self) -> usize {
        self.list.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dev::{BlockDevice, MemDisk};

    fn harness(sectors: u32) -> (Arc<BlockCache>, Arc<FreeMap>, Arc<Itable>) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = Arc::new(BlockCache::new(disk as Arc<dyn BlockDevice>));
        let freemap = Arc::new(FreeMap::open(Arc::clone(&cache)));
        freemap.format(sectors);
        let itable = Itable::new(Arc::clone(&cache), Arc::clone(&freemap));
        (cache, freemap, itable)
    }

    fn make_file(itable: &Arc<Itable>, freemap: &FreeMap, length: u32) -> InodeRef {
        let sector = freemap.allocate(1).unwrap();
        itable.create(sector, length, false).unwrap();
        itable.open(sector).unwrap()
    }

    #[test]
    fn empty_file_reads_nothing() {
        let (_c, freemap, itable) = harness(64);
        let inode = make_file(&itable, &freemap, 0);
        let mut buf = [0u8; 16];
        assert_eq!(inode.read_at(&mut buf, 0), 0);
        assert_eq!(inode.len(), 0);
    }

    #[test]
    fn write_then_read_across_indirect_boundary() {
        let (_c, freemap, itable) = harness(256);
        let inode = make_file(&itable, &freemap, 0);
        // 13 sectors reaches past the 12 direct slots.
        let len = 13 * SECTOR_SIZE;
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        assert_eq!(inode.write_at(&data, 0), len);
        let mut out = vec![0u8; len];
        assert_eq!(inode.read_at(&mut out, 0), len);
        assert_eq!(data, out);
    }

    #[test]
    fn open_twice_shares_one_inode() {
        let (_c, freemap, itable) = harness(64);
        let inode = make_file(&itable, &freemap, 0);
        let again = itable.open(inode.sector).unwrap();
        assert!(Arc::ptr_eq(&inode.inode, &again.inode));
        assert_eq!(itable.open_count(), 1);
        drop(again);
        assert_eq!(itable.open_count(), 1);
        drop(inode);
        assert_eq!(itable.open_count(), 0);
    }

    #[test]
    fn removed_inode_frees_everything_on_last_close() {
        let (_c, freemap, itable) = harness(256);
        let before = freemap.free_count();
        let inode = make_file(&itable, &freemap, 20 * SECTOR_SIZE as u32);
        inode.mark_removed();
        drop(inode);
        assert_eq!(freemap.free_count(), before);
    }

    #[test]
    fn failed_extension_rolls_back() {
        let (_c, freemap, itable) = harness(16);
        let inode = make_file(&itable, &freemap, 0);
        let free_before = freemap.free_count();
        // Far more than the device holds.
        let huge = vec![0u8; 64 * SECTOR_SIZE];
        assert_eq!(inode.write_at(&huge, 0), 0);
        assert_eq!(freemap.free_count(), free_before);
        assert_eq!(inode.len(), 0);
    }

    #[test]
    fn deny_write_bounces_writers() {
        let (_c, freemap, itable) = harness(64);
        let inode = make_file(&itable, &freemap, 0);
        inode.deny_write();
        assert_eq!(inode.write_at(b"hello", 0), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(b"hello", 0), 5);
    }

    #[test]
    fn byte_to_sector_boundaries() {
        let (_c, freemap, itable) = harness(64);
        let inode = make_file(&itable, &freemap, 0);
        // Fabricate an index; only the math is under test here.
        {
            let mut idx = inode.idx.lock();
            idx.length = (MAX_BLOCKS * SECTOR_SIZE) as u32;
            idx.direct = [0; NDIRECT];
            idx.direct[0] = 77;
        }
        let limit = inode.idx.lock().length;
        assert_eq!(inode.byte_to_sector(0, limit), Some(77));
        // Unallocated slots and out-of-range blocks resolve to None.
        assert_eq!(inode.byte_to_sector(SECTOR_SIZE as u32, limit), None);
        assert_eq!(
            inode.byte_to_sector((NDIRECT * SECTOR_SIZE) as u32, limit),
            None
        );
        assert_eq!(inode.byte_to_sector(limit, u32::MAX), None);
    }
}
