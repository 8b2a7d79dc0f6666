//! Executable sharing.
//!
//! Read-only executable pages with the same backing bytes, keyed by
//! `(inode sector, file offset)`, share one physical frame across every
//! process that maps them. The table holds, per key, the list of
//! supplemental pages that reference those bytes; a page joins the list the
//! first time it is paged in and leaves it when its process exits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::vm::page::Page;

pub type ShareKey = (u32, u32);

pub struct SharingTable {
    /// Sharer lists by key. Touched together with the frame table's state in
    /// the hand-off paths, which live in the frame module.
    pub(crate) map: Mutex<HashMap<ShareKey, Vec<Arc<Page>>>>,
}

impl Default for SharingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SharingTable {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `page` to its key's sharer list. The caller guarantees this runs
    /// at most once per page.
    pub fn register(&self, page: &Arc<Page>) {
        let key = page.share_key().expect("not a shareable page");
        self.map
            .lock()
            .entry(key)
            .or_default()
            .push(Arc::clone(page));
        log::trace!("sharing: registered page {:#x} under {:?}", page.vaddr, key);
    }

    /// Installs an existing sharer's frame into `page`'s page directory, if
    /// any sharer has one. Runs entirely under the table lock so a racing
    /// invalidation cannot slip between the lookup and the install.
    pub fn adopt_shared_frame(&self, page: &Arc<Page>) -> bool {
        let key = page.share_key().expect("not a shareable page");
        let map = self.map.lock();
        let Some(sharers) = map.get(&key) else {
            return false;
        };
        let frame = sharers.iter().find_map(|sharer| {
            if Arc::ptr_eq(sharer, page) {
                return None;
            }
            *sharer.paddr.lock()
        });
        match frame {
            Some(frame) => {
                *page.paddr.lock() = Some(frame);
                page.pd.set_page(page.vaddr, frame, false);
                true
            }
            None => false,
        }
    }

    /// Clears every sharer's page-directory entry and drops their frame
    /// pointer; used when the shared frame is evicted.
    pub fn invalidate(&self, page: &Arc<Page>) {
        let key = page.share_key().expect("not a shareable page");
        let map = self.map.lock();
        let Some(sharers) = map.get(&key) else {
            return;
        };
        for sharer in sharers {
            sharer.pd.clear_page(sharer.vaddr);
            *sharer.paddr.lock() = None;
        }
        log::trace!("sharing: invalidated {:?} across {} sharers", key, sharers.len());
    }

    /// True when any sharer is pinned.
    pub fn pinned(&self, page: &Arc<Page>) -> bool {
        let key = page.share_key().expect("not a shareable page");
        let map = self.map.lock();
        map.get(&key).map_or(false, |sharers| {
            sharers
                .iter()
                .any(|sharer| sharer.pinned.load(std::sync::atomic::Ordering::SeqCst))
        })
    }

    /// ORs the accessed bits of every sharer's mapping and clears them all.
    pub fn scan_and_clear_accessed(&self, page: &Arc<Page>) -> bool {
        let key = page.share_key().expect("not a shareable page");
        let map = self.map.lock();
        let mut accessed = false;
        if let Some(sharers) = map.get(&key) {
            for sharer in sharers {
                accessed |= sharer.pd.is_accessed(sharer.vaddr);
                sharer.pd.set_accessed(sharer.vaddr, false);
            }
        }
        accessed
    }

    /// Number of sharers currently registered under `key`.
    pub fn sharer_count(&self, key: ShareKey) -> usize {
        self.map.lock().get(&key).map_or(0, Vec::len)
    }
}
