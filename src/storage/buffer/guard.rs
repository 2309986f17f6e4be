use std::sync::Arc;

use log::debug;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::PageId;
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::page::{PageData, PageRef};

type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageData>;
type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageData>;

enum Latch {
    None,
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

/// Scoped ownership of a pinned page.
///
/// The guard pins the page on construction and may additionally hold the
/// page's R/W latch. On drop it releases the latch, unpins with the dirty
/// bit accumulated through `data_mut`/`mark_dirty`, and deletes the page if
/// `mark_delete` was called. Guards are move-only; latch crabbing hands them
/// off into a transaction's page set instead of releasing them.
pub struct PageGuard {
    bpm: Arc<BufferPoolManager>,
    page: PageRef,
    page_id: PageId,
    dirty: bool,
    delete: bool,
    latch: Latch,
}

impl PageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, page: PageRef, page_id: PageId) -> Self {
        Self {
            bpm,
            page,
            page_id,
            dirty: false,
            delete: false,
            latch: Latch::None,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Acquire the page latch in shared mode.
    pub fn latch_read(&mut self) {
        assert!(
            matches!(self.latch, Latch::None),
            "page {} latched twice",
            self.page_id
        );
        self.latch = Latch::Read(self.page.data().read_arc());
    }

    /// Acquire the page latch in exclusive mode.
    pub fn latch_write(&mut self) {
        assert!(
            matches!(self.latch, Latch::None),
            "page {} latched twice",
            self.page_id
        );
        self.latch = Latch::Write(self.page.data().write_arc());
    }

    /// Release the page latch while keeping the pin.
    pub fn unlatch(&mut self) {
        self.latch = Latch::None;
    }

    /// Page bytes; the latch must be held.
    pub fn data(&self) -> &[u8] {
        match &self.latch {
            Latch::Read(guard) => guard.as_slice(),
            Latch::Write(guard) => guard.as_slice(),
            Latch::None => panic!("page {} bytes accessed without the latch", self.page_id),
        }
    }

    /// Mutable page bytes; the write latch must be held. Marks the page
    /// dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        match &mut self.latch {
            Latch::Write(guard) => guard.as_mut_slice(),
            _ => panic!(
                "page {} mutated without the write latch",
                self.page_id
            ),
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Request deletion of the page once the pin is dropped.
    pub fn mark_delete(&mut self) {
        self.delete = true;
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        // Latch before pin: a deleted page must have no latch holders left.
        self.latch = Latch::None;
        if let Err(e) = self.bpm.unpin_page(self.page_id, self.dirty) {
            debug!("unpin of page {} failed: {}", self.page_id, e);
        }
        if self.delete {
            if let Err(e) = self.bpm.delete_page(self.page_id) {
                debug!("deferred delete of page {} failed: {}", self.page_id, e);
            }
        }
    }
}
