use std::fmt;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type; negative values are invalid
pub type PageId = i32;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = -1;

/// Page 0 holds the directory of (index name -> root page id) records
pub const HEADER_PAGE_ID: PageId = 0;

/// Buffer pool frame ID type, an index into the frame array
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = u32;

/// Record identifier: a (page, slot) pair addressing one tuple.
///
/// Ordered lexicographically so lock tables and lock sets can key on it;
/// the lock manager treats it as fully opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_num)
    }
}
