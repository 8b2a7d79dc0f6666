//! System-wide constants.

/// Smallest addressable unit of a block device, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Smallest unit of virtual-memory mapping, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Rotating buffers in the block cache.
pub const NBUF: usize = 64;

/// Total cache slots: the rotating set plus one pinned slot for the free map.
pub const NSLOT: usize = NBUF + 1;

/// Write-behind interval, in milliseconds.
pub const WRITE_BEHIND_INTERVAL_MS: u64 = 100;

/// Capacity of the read-ahead request queue. A full queue drops requests.
pub const READ_AHEAD_QUEUE: usize = 64;

/// Sector of the free-sector bitmap.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Direct sector slots in an inode.
pub const NDIRECT: usize = 12;

/// Sector indices held by one indirect block.
pub const NINDIRECT: usize = SECTOR_SIZE / 4;

/// Maximum length of a single file name component.
pub const NAME_MAX: usize = 14;

/// First user virtual address that is not usable: kernel space starts here.
pub const PHYS_BASE: usize = 0xC000_0000;

/// Maximum size of the user stack, in bytes.
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// Base address where a process's executable image is mapped.
pub const CODE_BASE: usize = 0x0804_8000;

/// Largest chunk written to the console in one burst.
pub const CONSOLE_CHUNK: usize = 200;

/// Open files and directories per process, console descriptors aside.
pub const NOFILE: usize = 128;
