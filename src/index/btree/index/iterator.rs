use std::sync::Arc;

use log::debug;

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::{BTreeIndex, MAX_RESTARTS};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::decode_node;
use crate::storage::buffer::{BufferPoolManager, PageGuard};

/// Forward iterator over `(key, rid)` pairs in key order.
///
/// Holds a pin on the current leaf plus a decoded snapshot of it taken
/// under a brief shared latch; advancing past the leaf's end follows
/// `next_page_id` and releases the previous pin. No latch is held between
/// calls to `next`.
pub struct IndexIterator<K: IndexKey> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<(PageGuard, BTreeNode<K>)>,
    index: usize,
}

impl<K: IndexKey> IndexIterator<K> {
    fn new(
        buffer_pool: Arc<BufferPoolManager>,
        leaf: Option<(PageGuard, BTreeNode<K>)>,
        index: usize,
    ) -> Self {
        let mut iterator = Self {
            buffer_pool,
            leaf,
            index,
        };
        iterator.skip_exhausted_leaf();
        iterator
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Move to the next leaf when the slot index has run off the current
    /// one. Leaves below minimum size cannot persist, but stay defensive
    /// about empty pages and decode failures mid-scan.
    fn skip_exhausted_leaf(&mut self) {
        loop {
            let next_page_id = match &self.leaf {
                Some((_, node)) if self.index >= node.size() => node.next_page_id,
                _ => return,
            };
            self.leaf = None;
            self.index = 0;
            if next_page_id == INVALID_PAGE_ID {
                return;
            }
            let mut guard = match self.buffer_pool.fetch_page(next_page_id) {
                Ok(guard) => guard,
                Err(e) => {
                    debug!("iterator stopped at page {}: {}", next_page_id, e);
                    return;
                }
            };
            guard.latch_read();
            let node = match decode_node::<K>(guard.data()) {
                Ok(node) => node,
                Err(e) => {
                    debug!("iterator stopped at page {}: {}", next_page_id, e);
                    return;
                }
            };
            guard.unlatch();
            self.leaf = Some((guard, node));
        }
    }
}

impl<K: IndexKey> Iterator for IndexIterator<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        let (_, node) = self.leaf.as_ref()?;
        let item = (node.keys[self.index], node.rids[self.index]);
        self.index += 1;
        self.skip_exhausted_leaf();
        Some(item)
    }
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Iterator positioned at the smallest key.
    pub fn iter(&self) -> Result<IndexIterator<K>, BTreeError> {
        self.make_iterator(None)
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<IndexIterator<K>, BTreeError> {
        self.make_iterator(Some(key))
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<IndexIterator<K>, BTreeError> {
        for _ in 0..MAX_RESTARTS {
            let leaf = match self.find_leaf_read(key) {
                Ok(leaf) => leaf,
                Err(BTreeError::InvalidPageFormat(_)) => continue,
                Err(e) => return Err(e),
            };
            let Some((mut guard, node)) = leaf else {
                return Ok(IndexIterator::new(Arc::clone(self.buffer_pool()), None, 0));
            };
            guard.unlatch();
            let index = match key {
                Some(key) => node.keys.partition_point(|k| k < key),
                None => 0,
            };
            return Ok(IndexIterator::new(
                Arc::clone(self.buffer_pool()),
                Some((guard, node)),
                index,
            ));
        }
        Err(BTreeError::Corrupted(
            "iterator kept racing root changes".into(),
        ))
    }
}
