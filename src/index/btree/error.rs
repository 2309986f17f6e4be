use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Invalid page format on page {0}")]
    InvalidPageFormat(PageId),

    #[error("Node capacities do not fit a page: leaf {leaf_max_size}, internal {internal_max_size}")]
    InvalidNodeCapacity {
        leaf_max_size: u32,
        internal_max_size: u32,
    },

    #[error("Header page directory rejected index '{0}'")]
    HeaderDirectoryFull(String),

    #[error("Tree structure violation: {0}")]
    Corrupted(String),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}
