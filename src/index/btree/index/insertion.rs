use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::{BTreeIndex, TreeOperation};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{decode_node, encode_node};
use crate::storage::buffer::PageGuard;
use crate::transaction::concurrency::Transaction;

impl<K: IndexKey> BTreeIndex<K> {
    /// Insert a key/rid pair. Returns false when the key is already present
    /// (unique index). All page latches taken by the descent are released on
    /// every exit path.
    pub fn insert(&self, key: &K, rid: Rid, txn: &Transaction) -> Result<bool, BTreeError> {
        let result = self.insert_inner(key, rid, txn);
        txn.release_all_pages();
        result
    }

    fn insert_inner(&self, key: &K, rid: Rid, txn: &Transaction) -> Result<bool, BTreeError> {
        let hold = self.find_leaf_write(key, TreeOperation::Insert, txn)?;

        if txn.page_set_len() == 0 {
            // Empty tree; the root guard is still held.
            self.start_new_tree(*key, rid)?;
            drop(hold);
            return Ok(true);
        }

        let mut leaf_guard = txn
            .pop_page_back()
            .ok_or_else(|| BTreeError::Corrupted("insert descent lost its leaf".into()))?;
        let mut leaf = decode_node::<K>(leaf_guard.data())?;

        if leaf.leaf_lookup(key).is_some() {
            return Ok(false);
        }

        if leaf.size() < leaf.insert_limit() {
            let index = leaf.leaf_insert(*key, rid);
            encode_node(&leaf, leaf_guard.data_mut());
            let needs_fixup = index == 0 && !leaf.is_root();
            let (leaf_id, leaf_first) = (leaf.page_id, leaf.first_key());
            drop(leaf_guard);
            if needs_fixup {
                self.fixup_first_key(leaf_id, leaf_first, txn)?;
            }
            return Ok(true);
        }

        self.split_leaf_and_insert(leaf_guard, &mut leaf, *key, rid, txn)?;
        Ok(true)
    }

    /// Seed a one-entry root leaf; callers hold the root guard.
    fn start_new_tree(&self, key: K, rid: Rid) -> Result<(), BTreeError> {
        let mut guard = self.buffer_pool().new_page()?;
        guard.latch_write();
        let mut leaf =
            BTreeNode::<K>::new_leaf(guard.page_id(), INVALID_PAGE_ID, self.leaf_max_size());
        leaf.leaf_insert(key, rid);
        encode_node(&leaf, guard.data_mut());
        let root_id = guard.page_id();
        drop(guard);
        self.publish_root(root_id)
    }

    /// Pre-split overflow: the leaf sits at `leaf_max_size - 1`. Move the
    /// upper half to a fresh leaf, splice the chain, place the new key so
    /// both halves respect the minimum, then push the separator upward.
    fn split_leaf_and_insert(
        &self,
        mut leaf_guard: PageGuard,
        leaf: &mut BTreeNode<K>,
        key: K,
        rid: Rid,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        let mut new_guard = self.buffer_pool().new_page()?;
        new_guard.latch_write();
        let mut new_leaf = leaf.split_upper_half(new_guard.page_id());

        let leaf_last = *leaf
            .keys
            .last()
            .ok_or_else(|| BTreeError::Corrupted("split emptied the leaf".into()))?;
        if key < leaf_last {
            leaf.leaf_insert(key, rid);
            let (moved_key, moved_rid) = leaf.leaf_pop_back();
            new_leaf.leaf_push_front(moved_key, moved_rid);
        } else {
            new_leaf.leaf_insert(key, rid);
        }

        if leaf.is_root() {
            // Both halves stay write-latched until the new root is live, or
            // a racing reader could descend into the old root and miss the
            // moved upper half.
            let root_id = self.make_new_root(
                leaf.first_key(),
                leaf.page_id,
                new_leaf.first_key(),
                new_leaf.page_id,
            )?;
            leaf.parent_page_id = root_id;
            new_leaf.parent_page_id = root_id;
            encode_node(leaf, leaf_guard.data_mut());
            encode_node(&new_leaf, new_guard.data_mut());
            return self.publish_root(root_id);
        }

        encode_node(leaf, leaf_guard.data_mut());
        encode_node(&new_leaf, new_guard.data_mut());

        let (left_id, left_first) = (leaf.page_id, leaf.first_key());
        let (right_id, right_first) = (new_leaf.page_id, new_leaf.first_key());
        // Descendant latches drop before the parent level is touched; the
        // exclusively latched ancestor chain keeps both halves unreachable.
        drop(new_guard);
        drop(leaf_guard);

        self.insert_into_parent(left_id, left_first, right_first, right_id, txn)
    }

    /// Route `(separator, new_child)` into the parent of `old_child`,
    /// splitting internals as needed and growing a new root when the split
    /// passes the old one. `old_first` refreshes old_child's separator.
    fn insert_into_parent(
        &self,
        old_id: PageId,
        old_first: K,
        separator: K,
        new_id: PageId,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        let mut parent_guard = txn
            .pop_page_back()
            .ok_or_else(|| BTreeError::Corrupted("split outran the retained latch chain".into()))?;
        let mut parent = decode_node::<K>(parent_guard.data())?;

        if parent.size() < parent.insert_limit() {
            parent.internal_insert_after(old_id, separator, new_id);
            let old_index = parent
                .child_index(old_id)
                .ok_or_else(|| BTreeError::Corrupted("split child missing from parent".into()))?;
            parent.keys[old_index] = old_first;
            encode_node(&parent, parent_guard.data_mut());

            let needs_fixup = old_index == 0 && !parent.is_root();
            let (parent_id, parent_first) = (parent.page_id, parent.first_key());
            drop(parent_guard);
            if needs_fixup {
                self.fixup_first_key(parent_id, parent_first, txn)?;
            }
            return Ok(());
        }

        // The parent is full: split it and re-home the moved children.
        let mut new_guard = self.buffer_pool().new_page()?;
        new_guard.latch_write();
        let mut new_internal = parent.split_upper_half(new_guard.page_id());

        if separator < new_internal.first_key() {
            parent.internal_insert_after(old_id, separator, new_id);
            let old_index = parent
                .child_index(old_id)
                .ok_or_else(|| BTreeError::Corrupted("split child missing from parent".into()))?;
            parent.keys[old_index] = old_first;
            // Rebalance so the left half keeps at least the minimum.
            let (moved_key, moved_child) = parent.internal_pop_back();
            new_internal.internal_push_front(moved_key, moved_child);
        } else {
            new_internal.internal_insert_after(old_id, separator, new_id);
            let old_index = new_internal
                .child_index(old_id)
                .ok_or_else(|| BTreeError::Corrupted("split child missing from parent".into()))?;
            new_internal.keys[old_index] = old_first;
        }

        let moved_children = new_internal.children.clone();
        let (parent_id, parent_first) = (parent.page_id, parent.first_key());
        let (new_internal_id, new_internal_first) =
            (new_internal.page_id, new_internal.first_key());

        if parent.is_root() {
            // As with a root leaf split, keep both halves latched until the
            // new root is published.
            let root_id = self.make_new_root(
                parent_first,
                parent_id,
                new_internal_first,
                new_internal_id,
            )?;
            parent.parent_page_id = root_id;
            new_internal.parent_page_id = root_id;
            encode_node(&parent, parent_guard.data_mut());
            encode_node(&new_internal, new_guard.data_mut());
            self.publish_root(root_id)?;
            drop(new_guard);
            drop(parent_guard);
            for child in moved_children {
                self.set_parent_pointer(child, new_internal_id)?;
            }
            return Ok(());
        }

        encode_node(&parent, parent_guard.data_mut());
        encode_node(&new_internal, new_guard.data_mut());
        drop(new_guard);
        drop(parent_guard);

        for child in moved_children {
            self.set_parent_pointer(child, new_internal_id)?;
        }

        self.insert_into_parent(
            parent_id,
            parent_first,
            new_internal_first,
            new_internal_id,
            txn,
        )
    }

    /// Allocate and encode a fresh internal root over two children. The
    /// caller publishes it and rewrites the children's parent pointers.
    fn make_new_root(
        &self,
        left_first: K,
        left_id: PageId,
        right_first: K,
        right_id: PageId,
    ) -> Result<PageId, BTreeError> {
        let mut root_guard = self.buffer_pool().new_page()?;
        root_guard.latch_write();
        let mut root = BTreeNode::<K>::new_internal(
            root_guard.page_id(),
            INVALID_PAGE_ID,
            self.internal_max_size(),
        );
        root.populate_new_root(left_first, left_id, right_first, right_id);
        encode_node(&root, root_guard.data_mut());
        Ok(root_guard.page_id())
    }
}
