use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::types::{PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// The raw bytes of one page, guarded by the page latch.
pub struct PageData {
    bytes: [u8; PAGE_SIZE],
}

impl PageData {
    pub fn new() -> Self {
        Self {
            bytes: [0; PAGE_SIZE],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn reset(&mut self) {
        self.bytes.fill(0);
    }
}

impl Default for PageData {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer pool frame: one page's bytes plus its cache metadata.
///
/// The bytes live behind the page latch (an R/W lock callers take through
/// `PageGuard`); the metadata fields are mutated only under the pool latch
/// and stored as atomics so readers can peek without it.
pub struct Page {
    data: Arc<RwLock<PageData>>,
    page_id: AtomicI32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

/// Shared handle to a frame
pub type PageRef = Arc<Page>;

impl Page {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(PageData::new())),
            page_id: AtomicI32::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// The R/W-latched byte store; latch acquisition goes through here.
    pub fn data(&self) -> &Arc<RwLock<PageData>> {
        &self.data
    }

    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id, Ordering::Release);
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn set_pin_count(&self, count: u32) {
        self.pin_count.store(count, Ordering::Release);
    }

    pub(crate) fn incr_pin_count(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decr_pin_count(&self) {
        self.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
