use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::{BTreeIndex, TreeOperation};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{decode_node, encode_node};
use crate::storage::buffer::PageGuard;
use crate::transaction::concurrency::Transaction;

impl<K: IndexKey> BTreeIndex<K> {
    /// Delete a key if present. Removing a missing key is a no-op. All page
    /// latches taken by the descent are released on every exit path.
    pub fn remove(&self, key: &K, txn: &Transaction) -> Result<(), BTreeError> {
        let result = self.remove_inner(key, txn);
        txn.release_all_pages();
        result
    }

    fn remove_inner(&self, key: &K, txn: &Transaction) -> Result<(), BTreeError> {
        let hold = self.find_leaf_write(key, TreeOperation::Delete, txn)?;
        if txn.page_set_len() == 0 {
            drop(hold);
            return Ok(());
        }

        let mut leaf_guard = txn
            .pop_page_back()
            .ok_or_else(|| BTreeError::Corrupted("delete descent lost its leaf".into()))?;
        let mut leaf = decode_node::<K>(leaf_guard.data())?;

        if leaf.leaf_remove(key).is_none() {
            return Ok(());
        }
        encode_node(&leaf, leaf_guard.data_mut());

        self.coalesce_or_redistribute(leaf, leaf_guard, txn)?;
        drop(hold);
        Ok(())
    }

    /// Restore the size invariant for `node` after a removal: fix the parent
    /// separator when the node is still at least half full, otherwise borrow
    /// from or merge with a sibling, recursing when the parent underflows.
    /// Takes ownership of the node's guard so descendant latches are gone by
    /// the time the parent level is touched.
    fn coalesce_or_redistribute(
        &self,
        mut node: BTreeNode<K>,
        mut node_guard: PageGuard,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        if node.is_root() {
            return self.adjust_root(node, node_guard, txn);
        }

        let mut parent_guard = txn
            .pop_page_back()
            .ok_or_else(|| BTreeError::Corrupted("delete outran the retained latch chain".into()))?;
        let mut parent = decode_node::<K>(parent_guard.data())?;
        let index = parent.child_index(node.page_id).ok_or_else(|| {
            BTreeError::Corrupted(format!(
                "page {} missing from parent {}",
                node.page_id, parent.page_id
            ))
        })?;

        if node.size() >= node.min_size() {
            // No structural change; only the separator may be stale.
            parent.keys[index] = node.first_key();
            encode_node(&parent, parent_guard.data_mut());
            drop(node_guard);

            let needs_fixup = index == 0 && !parent.is_root();
            let (parent_id, parent_first) = (parent.page_id, parent.first_key());
            drop(parent_guard);
            if needs_fixup {
                self.fixup_first_key(parent_id, parent_first, txn)?;
            }
            return Ok(());
        }

        let (mut sibling_guard, mut sibling, sibling_index, sibling_is_left) =
            self.pick_sibling(&parent, index)?;

        if sibling.size() > sibling.min_size() {
            // Redistribute one entry across and refresh both separators.
            let mut moved_child = None;
            if sibling_is_left {
                if node.is_leaf() {
                    let (key, rid) = sibling.leaf_pop_back();
                    node.leaf_push_front(key, rid);
                } else {
                    let (key, child) = sibling.internal_pop_back();
                    node.internal_push_front(key, child);
                    moved_child = Some(child);
                }
            } else {
                if node.is_leaf() {
                    let (key, rid) = sibling.leaf_pop_front();
                    node.leaf_push_back(key, rid);
                } else {
                    let (key, child) = sibling.internal_pop_front();
                    node.internal_push_back(key, child);
                    moved_child = Some(child);
                }
                parent.keys[sibling_index] = sibling.first_key();
            }
            parent.keys[index] = node.first_key();

            encode_node(&node, node_guard.data_mut());
            encode_node(&sibling, sibling_guard.data_mut());
            encode_node(&parent, parent_guard.data_mut());

            let node_id = node.page_id;
            let needs_fixup = index == 0 && !parent.is_root();
            let (parent_id, parent_first) = (parent.page_id, parent.first_key());
            drop(node_guard);
            drop(sibling_guard);
            drop(parent_guard);

            if let Some(child) = moved_child {
                self.set_parent_pointer(child, node_id)?;
            }
            if needs_fixup {
                self.fixup_first_key(parent_id, parent_first, txn)?;
            }
            return Ok(());
        }

        // Merge into the left partner of the pair and drop the right one.
        // An internal node's slot-0 key is maintained equal to its subtree
        // minimum, so it already carries the right separator for the move.
        let merged_first_index: usize;
        if sibling_is_left {
            let moved_children = node.children.clone();
            sibling.absorb_right_sibling(&mut node);
            parent.internal_remove_at(index);
            parent.keys[sibling_index] = sibling.first_key();
            merged_first_index = sibling_index;

            encode_node(&sibling, sibling_guard.data_mut());
            encode_node(&node, node_guard.data_mut());
            encode_node(&parent, parent_guard.data_mut());

            node_guard.mark_delete();
            txn.add_into_deleted_page_set(node.page_id);
            let sibling_id = sibling.page_id;
            drop(node_guard);
            drop(sibling_guard);
            for child in moved_children {
                self.set_parent_pointer(child, sibling_id)?;
            }
        } else {
            let moved_children = sibling.children.clone();
            node.absorb_right_sibling(&mut sibling);
            parent.internal_remove_at(sibling_index);
            parent.keys[index] = node.first_key();
            merged_first_index = index;

            encode_node(&node, node_guard.data_mut());
            encode_node(&sibling, sibling_guard.data_mut());
            encode_node(&parent, parent_guard.data_mut());

            sibling_guard.mark_delete();
            txn.add_into_deleted_page_set(sibling.page_id);
            let node_id = node.page_id;
            drop(sibling_guard);
            drop(node_guard);
            for child in moved_children {
                self.set_parent_pointer(child, node_id)?;
            }
        }

        if parent.size() < parent.min_size() {
            return self.coalesce_or_redistribute(parent, parent_guard, txn);
        }

        let needs_fixup = merged_first_index == 0 && !parent.is_root();
        let (parent_id, parent_first) = (parent.page_id, parent.first_key());
        drop(parent_guard);
        if needs_fixup {
            self.fixup_first_key(parent_id, parent_first, txn)?;
        }
        Ok(())
    }

    /// Sibling choice: the leftmost child pairs with its right neighbor, the
    /// rightmost with its left; interior children prefer a partner that can
    /// lend an entry, falling back to merging leftward.
    fn pick_sibling(
        &self,
        parent: &BTreeNode<K>,
        index: usize,
    ) -> Result<(PageGuard, BTreeNode<K>, usize, bool), BTreeError> {
        let end_index = parent.size() - 1;
        if index == 0 {
            let (guard, sibling) = self.fetch_node_write(parent.children[1])?;
            return Ok((guard, sibling, 1, false));
        }
        if index == end_index {
            let (guard, sibling) = self.fetch_node_write(parent.children[index - 1])?;
            return Ok((guard, sibling, index - 1, true));
        }

        let (left_guard, left) = self.fetch_node_write(parent.children[index - 1])?;
        if left.size() > left.min_size() {
            return Ok((left_guard, left, index - 1, true));
        }
        let (right_guard, right) = self.fetch_node_write(parent.children[index + 1])?;
        if right.size() > right.min_size() {
            return Ok((right_guard, right, index + 1, false));
        }
        drop(right_guard);
        Ok((left_guard, left, index - 1, true))
    }

    /// Root underflow: an empty root leaf empties the tree; a single-child
    /// root internal promotes its only child.
    fn adjust_root(
        &self,
        mut root: BTreeNode<K>,
        mut root_guard: PageGuard,
        txn: &Transaction,
    ) -> Result<(), BTreeError> {
        if root.size() >= root.min_size() {
            return Ok(());
        }

        if root.is_leaf() {
            debug_assert_eq!(root.size(), 0);
            self.publish_root(INVALID_PAGE_ID)?;
            root_guard.mark_delete();
            txn.add_into_deleted_page_set(root.page_id);
            return Ok(());
        }

        let child = root.remove_and_return_only_child();
        self.set_parent_pointer(child, INVALID_PAGE_ID)?;
        self.publish_root(child)?;
        root_guard.mark_delete();
        txn.add_into_deleted_page_set(root.page_id);
        Ok(())
    }
}
