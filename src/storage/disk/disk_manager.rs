use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual page-granular file I/O and owns the
/// page id allocator. Page 0 is reserved for the header page.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicI32,
    free_pages: Mutex<Vec<PageId>>,
}

impl DiskManager {
    /// Open (or create) the database file at the given path.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        // Resume allocation after the last page present in the file; the
        // header page occupies slot 0 even in an empty file.
        let file_size = file.metadata()?.len();
        let next_page_id = ((file_size / PAGE_SIZE as u64) as PageId).max(1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
            free_pages: Mutex::new(Vec::new()),
        })
    }

    /// Read a page from disk into `buf`. Reading a page that has never been
    /// written yields zeroed bytes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page to disk.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Allocate a new page id, reusing deallocated ids when available.
    pub fn allocate_page(&self) -> PageId {
        if let Some(page_id) = self.free_pages.lock().pop() {
            return page_id;
        }
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Return a page id to the allocator.
    pub fn deallocate_page(&self, page_id: PageId) {
        if page_id <= 0 {
            return;
        }
        self.free_pages.lock().push(page_id);
    }
}
