use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::{BTreeIndex, TreeOperation, MAX_RESTARTS};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{
    capacities_fit, decode_node, encode_node, write_parent_page_id,
};
use crate::storage::buffer::{BufferPoolManager, PageGuard};
use crate::storage::page::HeaderPage;
use crate::transaction::concurrency::Transaction;

/// Writer's hold on the root guard mutex, released once the descent proves
/// no structural change can reach the root.
pub(crate) struct RootHold {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl RootHold {
    pub(crate) fn release(&mut self) {
        self.guard.take();
    }
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Open the index named `name`, registering it in the header page on
    /// first use and reloading its root page id on subsequent opens.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self, BTreeError> {
        if !capacities_fit::<K>(leaf_max_size, internal_max_size) {
            return Err(BTreeError::InvalidNodeCapacity {
                leaf_max_size,
                internal_max_size,
            });
        }
        let index_name = name.into();

        let mut header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        header.latch_write();
        let root_page_id = match HeaderPage::get_record(header.data(), &index_name) {
            Some(root_page_id) => root_page_id,
            None => {
                if !HeaderPage::insert_record(header.data_mut(), &index_name, INVALID_PAGE_ID) {
                    return Err(BTreeError::HeaderDirectoryFull(index_name));
                }
                INVALID_PAGE_ID
            }
        };
        drop(header);

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: RwLock::new(root_page_id),
            root_guard: Arc::new(Mutex::new(())),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub(crate) fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.buffer_pool
    }

    pub(crate) fn leaf_max_size(&self) -> u32 {
        self.leaf_max_size
    }

    pub(crate) fn internal_max_size(&self) -> u32 {
        self.internal_max_size
    }

    /// Point lookup. The transaction is accepted for interface symmetry with
    /// the write operations; read descents leave no state behind in it.
    pub fn get_value(&self, key: &K, _txn: &Transaction) -> Result<Option<Rid>, BTreeError> {
        for _ in 0..MAX_RESTARTS {
            match self.find_leaf_read(Some(key)) {
                Ok(None) => return Ok(None),
                Ok(Some((_, leaf))) => return Ok(leaf.leaf_lookup(key)),
                // The root moved underneath the descent; start over.
                Err(BTreeError::InvalidPageFormat(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(BTreeError::Corrupted(
            "search kept racing root changes".into(),
        ))
    }

    /// Hand-over-hand read descent to the leaf covering `key`, or the
    /// leftmost leaf when `key` is `None`. Returns the latched leaf guard
    /// with its decoded node, or `None` for an empty tree.
    pub(crate) fn find_leaf_read(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(PageGuard, BTreeNode<K>)>, BTreeError> {
        let root_id = *self.root_page_id.read();
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.buffer_pool.fetch_page(root_id)?;
        guard.latch_read();
        let mut node = decode_node::<K>(guard.data())?;
        if node.page_id != root_id || !node.is_root() {
            return Err(BTreeError::InvalidPageFormat(root_id));
        }

        loop {
            if node.is_leaf() {
                return Ok(Some((guard, node)));
            }
            let child_id = match key {
                Some(key) => node.lookup_child(key),
                None => node.children[0],
            };
            let mut child_guard = self.buffer_pool.fetch_page(child_id)?;
            child_guard.latch_read();
            let child = decode_node::<K>(child_guard.data())?;
            guard = child_guard;
            node = child;
        }
    }

    /// Write descent with latch crabbing. The exclusively latched path ends
    /// up in the transaction's page set (leaf at the back); ancestors above
    /// the deepest safe node are released before returning, as is the root
    /// guard unless the safe point is the root itself. An empty page set
    /// signals an empty tree, with the root guard still held.
    pub(crate) fn find_leaf_write(
        &self,
        key: &K,
        op: TreeOperation,
        txn: &Transaction,
    ) -> Result<RootHold, BTreeError> {
        debug_assert!(op != TreeOperation::Search);
        let mut hold = RootHold {
            guard: Some(self.root_guard.lock_arc()),
        };

        let root_id = *self.root_page_id.read();
        if root_id == INVALID_PAGE_ID {
            return Ok(hold);
        }

        let mut safe_id = root_id;
        let mut no_more_release = false;
        let mut page_id = root_id;
        loop {
            let mut guard = self.buffer_pool.fetch_page(page_id)?;
            guard.latch_write();
            let node = decode_node::<K>(guard.data())?;
            let is_leaf = node.is_leaf();

            if !no_more_release {
                // Separator fixups may climb to this node's parent: a new
                // minimum entering the subtree, or a deleted key that doubles
                // as a separator. Freeze the retained chain here.
                let retains = match op {
                    TreeOperation::Insert => node.size() > 0 && *key < node.first_key(),
                    TreeOperation::Delete => {
                        if is_leaf {
                            node.keys.binary_search(key).is_ok()
                        } else {
                            node.routing_contains(key)
                        }
                    }
                    TreeOperation::Search => false,
                };
                if retains {
                    no_more_release = true;
                } else {
                    let size_safe = match op {
                        TreeOperation::Insert => node.size() < node.insert_limit(),
                        TreeOperation::Delete => node.size() > node.min_size(),
                        TreeOperation::Search => true,
                    };
                    if size_safe {
                        safe_id = node.page_id;
                    }
                }
            }

            let next = if is_leaf {
                None
            } else {
                Some(node.lookup_child(key))
            };
            txn.add_into_page_set(guard);
            match next {
                Some(child) => page_id = child,
                None => break,
            }
        }

        // Release every ancestor above the safe node, front-first.
        while txn.page_set_len() > 1 && txn.front_page_id() != Some(safe_id) {
            drop(txn.pop_page_front());
        }
        if safe_id != root_id {
            hold.release();
        }
        Ok(hold)
    }

    pub(crate) fn fetch_node_write(
        &self,
        page_id: PageId,
    ) -> Result<(PageGuard, BTreeNode<K>), BTreeError> {
        let mut guard = self.buffer_pool.fetch_page(page_id)?;
        guard.latch_write();
        let node = decode_node::<K>(guard.data())?;
        Ok((guard, node))
    }

    fn fetch_node_read(&self, page_id: PageId) -> Result<BTreeNode<K>, BTreeError> {
        let mut guard = self.buffer_pool.fetch_page(page_id)?;
        guard.latch_read();
        let node = decode_node::<K>(guard.data())?;
        Ok(node)
    }

    /// Rewrite a child's parent pointer in place.
    pub(crate) fn set_parent_pointer(
        &self,
        child_page_id: PageId,
        parent_page_id: PageId,
    ) -> Result<(), BTreeError> {
        let mut guard = self.buffer_pool.fetch_page(child_page_id)?;
        guard.latch_write();
        write_parent_page_id(guard.data_mut(), parent_page_id);
        Ok(())
    }

    /// Publish a new root page id under the root latch and mirror it into
    /// the header page record.
    pub(crate) fn publish_root(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        *self.root_page_id.write() = root_page_id;
        let mut header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        header.latch_write();
        if !HeaderPage::update_record(header.data_mut(), &self.index_name, root_page_id) {
            return Err(BTreeError::Corrupted(format!(
                "index '{}' missing from the header directory",
                self.index_name
            )));
        }
        Ok(())
    }

    /// Climb separator fixups: set the parent's routing key for `child` to
    /// the child's new first key, continuing upward while the fixup lands in
    /// slot 0. Consumes retained ancestors from the page set; stops when the
    /// chain runs out.
    pub(crate) fn fixup_first_key(
        &self,
        mut child_id: PageId,
        mut child_first: K,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        while let Some(mut parent_guard) = txn.pop_page_back() {
            let mut parent = decode_node::<K>(parent_guard.data())?;
            let index = parent.child_index(child_id).ok_or_else(|| {
                BTreeError::Corrupted(format!("page {} missing from parent {}", child_id, parent.page_id))
            })?;
            parent.keys[index] = child_first;
            encode_node(&parent, parent_guard.data_mut());

            let continue_up = index == 0 && !parent.is_root();
            child_id = parent.page_id;
            child_first = parent.first_key();
            drop(parent_guard);
            if !continue_up {
                break;
            }
        }
        Ok(())
    }

    /// Walk the whole tree checking the structural invariants: size bounds,
    /// parent pointers, separator/first-key agreement, and a sorted,
    /// complete leaf chain. Intended for tests and debugging.
    pub fn verify_integrity(&self) -> Result<(), BTreeError> {
        let root_id = *self.root_page_id.read();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaves = Vec::new();
        self.verify_subtree(root_id, INVALID_PAGE_ID, &mut leaves)?;

        // The chain must visit exactly the leaves found by the tree walk, in
        // order, with globally ascending keys.
        let mut chained = Vec::new();
        let mut previous_key: Option<K> = None;
        let mut page_id = leaves
            .first()
            .copied()
            .ok_or_else(|| BTreeError::Corrupted("tree has no leaves".into()))?;
        loop {
            let leaf = self.fetch_node_read(page_id)?;
            if !leaf.is_leaf() {
                return Err(BTreeError::Corrupted(format!(
                    "leaf chain reached internal page {}",
                    page_id
                )));
            }
            chained.push(page_id);
            for key in &leaf.keys {
                if let Some(previous) = previous_key {
                    if previous >= *key {
                        return Err(BTreeError::Corrupted(format!(
                            "leaf chain out of order at page {}",
                            page_id
                        )));
                    }
                }
                previous_key = Some(*key);
            }
            if leaf.next_page_id == INVALID_PAGE_ID {
                break;
            }
            page_id = leaf.next_page_id;
        }
        if chained != leaves {
            return Err(BTreeError::Corrupted(
                "leaf chain does not match the tree walk".into(),
            ));
        }
        Ok(())
    }

    fn verify_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        leaves: &mut Vec<PageId>,
    ) -> Result<K, BTreeError> {
        let node = self.fetch_node_read(page_id)?;
        if node.page_id != page_id {
            return Err(BTreeError::Corrupted(format!(
                "page {} records id {}",
                page_id, node.page_id
            )));
        }
        if node.parent_page_id != expected_parent {
            return Err(BTreeError::Corrupted(format!(
                "page {} records parent {}, expected {}",
                page_id, node.parent_page_id, expected_parent
            )));
        }
        if !node.is_root() && node.size() < node.min_size() {
            return Err(BTreeError::Corrupted(format!(
                "page {} under-full: {} < {}",
                page_id,
                node.size(),
                node.min_size()
            )));
        }
        if node.size() > node.insert_limit() {
            return Err(BTreeError::Corrupted(format!(
                "page {} over-full: {}",
                page_id,
                node.size()
            )));
        }
        // Keys ascend strictly; an internal node's slot 0 is the sentinel.
        let ordered_from = if node.is_leaf() { 0 } else { 1 };
        for window in node.keys[ordered_from..].windows(2) {
            if window[0] >= window[1] {
                return Err(BTreeError::Corrupted(format!(
                    "page {} keys out of order",
                    page_id
                )));
            }
        }

        if node.is_leaf() {
            leaves.push(page_id);
            return Ok(node.first_key());
        }

        let mut subtree_first = node.first_key();
        for (i, &child) in node.children.iter().enumerate() {
            let child_first = self.verify_subtree(child, page_id, leaves)?;
            if i == 0 {
                subtree_first = child_first;
            } else if node.keys[i] != child_first {
                return Err(BTreeError::Corrupted(format!(
                    "separator {} of page {} disagrees with child {} first key",
                    i, page_id, child
                )));
            }
        }
        Ok(subtree_first)
    }
}
