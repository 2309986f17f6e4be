use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::types::PageId;
use crate::index::btree::key::IndexKey;
use crate::storage::buffer::BufferPoolManager;

mod base;
mod deletion;
mod insertion;
mod iterator;

pub use iterator::IndexIterator;

/// Operation kinds driving the latch crabbing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeOperation {
    Search,
    Insert,
    Delete,
}

/// Bounded restarts for descents invalidated by a concurrent root change.
pub(crate) const MAX_RESTARTS: usize = 8;

/// A concurrent B+Tree over buffer pool pages, keyed on fixed-size byte
/// keys and valued by record identifiers (unique index).
///
/// Nodes are pages obtained from the buffer pool; leaves chain forward for
/// range scans. Concurrent access follows latch crabbing over the per-page
/// latches: readers hand-over-hand with shared latches, writers serialize
/// their descent on `root_guard` and keep the exclusively latched path in
/// the transaction's page set until the deepest safe node is known.
pub struct BTreeIndex<K: IndexKey> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    /// R/W latch over the root page id itself.
    root_page_id: RwLock<PageId>,
    /// Serializes writer descents from the root until safety is established.
    root_guard: Arc<Mutex<()>>,
    leaf_max_size: u32,
    internal_max_size: u32,
    _key: PhantomData<K>,
}
