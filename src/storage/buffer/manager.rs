use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{FrameId, PageId, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::guard::PageGuard;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageRef};

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// A bounded cache of frames over the disk file.
///
/// The pool owns all page memory. Callers hold pages only through pinned
/// `PageGuard` handles; a single pool latch serializes metadata changes
/// (page table, free list, pin counts), while page bytes are protected by
/// the per-page latch taken through the guard.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PageRef>,
    state: Mutex<PoolState>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Page::new())).collect();
        let free_list = (0..pool_size).collect();

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetch a page, pinning it. Loads from disk if not resident, evicting
    /// the LRU unpinned frame when no frame is free.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard, BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            if frame.pin_count() == 0 {
                self.replacer.pin(frame_id);
            }
            frame.incr_pin_count();
            return Ok(PageGuard::new(Arc::clone(self), Arc::clone(frame), page_id));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.frames[frame_id];

        {
            let mut data = frame.data().write();
            if let Err(e) = self.disk_manager.read_page(page_id, data.as_mut_slice()) {
                drop(data);
                frame.set_page_id(INVALID_PAGE_ID);
                state.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.set_pin_count(1);
        state.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(Arc::clone(self), Arc::clone(frame), page_id))
    }

    /// Allocate a fresh page on disk and pin a zeroed frame for it. Fails
    /// with `BufferPoolFull` iff every frame is pinned.
    pub fn new_page(self: &Arc<Self>) -> Result<PageGuard, BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.frames[frame_id];

        let page_id = self.disk_manager.allocate_page();
        frame.data().write().reset();
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.set_pin_count(1);
        state.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(Arc::clone(self), Arc::clone(frame), page_id))
    }

    /// Drop one pin, ORing `is_dirty` into the frame's dirty bit. On the
    /// last unpin the frame becomes an eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let state = self.state.lock();
        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        let frame = &self.frames[frame_id];

        if frame.pin_count() == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.pin_count() == 1 {
            self.replacer.unpin(frame_id);
        }
        frame.decr_pin_count();
        Ok(())
    }

    /// Write a resident page back to disk unconditionally. The dirty bit is
    /// deliberately left set: flushing is a durability hint, not a state
    /// transition.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let state = self.state.lock();
        let frame_id = *state
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        let frame = &self.frames[frame_id];

        let data = frame.data().read();
        self.disk_manager.write_page(page_id, data.as_slice())?;
        Ok(())
    }

    /// Write every resident page back to disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let state = self.state.lock();
        for (&page_id, &frame_id) in state.page_table.iter() {
            let frame = &self.frames[frame_id];
            let data = frame.data().read();
            self.disk_manager.write_page(page_id, data.as_slice())?;
        }
        Ok(())
    }

    /// Remove a page from the pool and deallocate it on disk. Succeeds if
    /// the page is not resident; fails if it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                self.disk_manager.deallocate_page(page_id);
                return Ok(());
            }
        };
        let frame = &self.frames[frame_id];

        if frame.pin_count() > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.replacer.pin(frame_id);
        state.page_table.remove(&page_id);
        frame.data().write().reset();
        frame.set_page_id(INVALID_PAGE_ID);
        frame.set_dirty(false);
        state.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Pick a usable frame: free list first, then the LRU victim (writing
    /// its page back if dirty and unmapping it).
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;
        let frame = &self.frames[frame_id];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            debug!("evicting dirty page {}, writing back", old_page_id);
            let data = frame.data().read();
            if let Err(e) = self.disk_manager.write_page(old_page_id, data.as_slice()) {
                drop(data);
                self.replacer.unpin(frame_id);
                return Err(e.into());
            }
        }
        state.page_table.remove(&old_page_id);
        Ok(frame_id)
    }
}
