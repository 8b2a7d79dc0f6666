//! Path resolution.
//!
//! Resolves a path to `(parent directory, final component)`. The caller
//! decides whether the final component must exist (open, remove) or must not
//! (create, mkdir): a missing final component is a legitimate outcome here,
//! but a missing intermediate component is an error.

use std::sync::Arc;

use crate::dev::SectorId;
use crate::error::{KernelError, Result};
use crate::fs::dir::Dir;
use crate::fs::inode::{InodeRef, Itable};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// Resolves `path`, starting at the root for absolute paths and at `cwd`
/// otherwise. Returns the parent directory and the last component; a pure
/// root path resolves to `(root, ".")`.
pub fn parse<'p>(itable: &Arc<Itable>, path: &'p str, cwd: SectorId) -> Result<(Dir, &'p str)> {
    if path.is_empty() {
        return Err(KernelError::InvalidPath);
    }
    let start = if path.starts_with('/') {
        ROOT_DIR_SECTOR
    } else {
        cwd
    };
    let mut parent = Dir::open(itable.open(start)?)?;
    let mut name = ".";
    let mut next: Option<InodeRef> = None;

    let mut tokens = path.split('/').filter(|t| !t.is_empty()).peekable();
    while let Some(token) = tokens.next() {
        if token.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        // Descend into the previous component before looking this one up.
        if let Some(inode) = next.take() {
            parent = Dir::open(inode)?;
        }
        name = token;
        match parent.lookup(token) {
            Some(sector) => next = Some(itable.open(sector)?),
            None => {
                // The last component may legitimately not exist yet.
                if tokens.peek().is_some() {
                    return Err(KernelError::NotFound);
                }
            }
        }
    }
    Ok((parent, name))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bio::BlockCache;
    use crate::dev::{BlockDevice, MemDisk};
    use crate::fs::freemap::FreeMap;

    fn rooted_itable() -> (Arc<FreeMap>, Arc<Itable>) {
        let disk = Arc::new(MemDisk::new(256));
        let cache = Arc::new(BlockCache::new(disk as Arc<dyn BlockDevice>));
        let freemap = Arc::new(FreeMap::open(Arc::clone(&cache)));
        freemap.format(256);
        let itable = Itable::new(cache, Arc::clone(&freemap));
        Dir::create(&itable, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR, 16).unwrap();
        (freemap, itable)
    }

    fn mkdir_in(itable: &Arc<Itable>, freemap: &FreeMap, parent: &Dir, name: &str) -> SectorId {
        let sector = freemap.allocate(1).unwrap();
        Dir::create(itable, sector, parent.inumber(), 0).unwrap();
        parent.add(name, sector).unwrap();
        sector
    }

    #[test]
    fn empty_path_is_invalid() {
        let (_f, itable) = rooted_itable();
        assert_eq!(
            parse(&itable, "", ROOT_DIR_SECTOR).err(),
            Some(KernelError::InvalidPath)
        );
    }

    #[test]
    fn pure_root_resolves_to_dot() {
        let (_f, itable) = rooted_itable();
        let (dir, name) = parse(&itable, "/", ROOT_DIR_SECTOR).unwrap();
        assert_eq!(dir.inumber(), ROOT_DIR_SECTOR);
        assert_eq!(name, ".");
    }

    #[test]
    fn resolves_nested_and_missing_leaf() {
        let (freemap, itable) = rooted_itable();
        let root = Dir::open(itable.open(ROOT_DIR_SECTOR).unwrap()).unwrap();
        let a = mkdir_in(&itable, &freemap, &root, "a");
        let _b = mkdir_in(
            &itable,
            &freemap,
            &Dir::open(itable.open(a).unwrap()).unwrap(),
            "b",
        );

        let (dir, name) = parse(&itable, "/a/b", ROOT_DIR_SECTOR).unwrap();
        assert_eq!(dir.inumber(), a);
        assert_eq!(name, "b");

        // Missing leaf is fine; missing intermediate is not.
        let (dir, name) = parse(&itable, "/a/new", ROOT_DIR_SECTOR).unwrap();
        assert_eq!(dir.inumber(), a);
        assert_eq!(name, "new");
        assert_eq!(
            parse(&itable, "/a/no/such", ROOT_DIR_SECTOR).err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn relative_paths_start_at_cwd() {
        let (freemap, itable) = rooted_itable();
        let root = Dir::open(itable.open(ROOT_DIR_SECTOR).unwrap()).unwrap();
        let a = mkdir_in(&itable, &freemap, &root, "a");
        let (dir, name) = parse(&itable, "x", a).unwrap();
        assert_eq!(dir.inumber(), a);
        assert_eq!(name, "x");
        // `..` entries resolve like any other component.
        let (dir, name) = parse(&itable, "../a", a).unwrap();
        assert_eq!(dir.inumber(), ROOT_DIR_SECTOR);
        assert_eq!(name, "a");
    }

    #[test]
    fn component_over_name_max_is_rejected() {
        let (_f, itable) = rooted_itable();
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(
            parse(&itable, &long, ROOT_DIR_SECTOR).err(),
            Some(KernelError::NameTooLong)
        );
    }

    #[test]
    fn file_in_the_middle_fails() {
        let (freemap, itable) = rooted_itable();
        let root = Dir::open(itable.open(ROOT_DIR_SECTOR).unwrap()).unwrap();
        let sector = freemap.allocate(1).unwrap();
        itable.create(sector, 0, false).unwrap();
        root.add("plain", sector).unwrap();
        assert_eq!(
            parse(&itable, "/plain/child", ROOT_DIR_SECTOR).err(),
            Some(KernelError::NotDirectory)
        );
    }
}
