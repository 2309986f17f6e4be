use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{BTreeNode, BTreeNodeType};

// Common header layout (24 bytes):
// | page_type(4) | lsn(4) | size(4) | max_size(4) | parent_page_id(4) | page_id(4) |
// Leaves persist next_page_id(4) right after the header; the (key, value)
// pair array follows.
const PAGE_TYPE_OFFSET: usize = 0;
const LSN_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 8;
const MAX_SIZE_OFFSET: usize = 12;
const PARENT_OFFSET: usize = 16;
const PAGE_ID_OFFSET: usize = 20;
pub(crate) const HEADER_SIZE: usize = 24;
const NEXT_PAGE_OFFSET: usize = HEADER_SIZE;
const LEAF_PAIRS_OFFSET: usize = HEADER_SIZE + 4;
const INTERNAL_PAIRS_OFFSET: usize = HEADER_SIZE;

fn leaf_slot_size<K: IndexKey>() -> usize {
    K::ENCODED_SIZE + 8
}

fn internal_slot_size<K: IndexKey>() -> usize {
    K::ENCODED_SIZE + 4
}

/// Whether nodes of the given capacities fit inside one page. Internals
/// need room for four children so non-root nodes always keep a sibling to
/// borrow from or merge with.
pub fn capacities_fit<K: IndexKey>(leaf_max_size: u32, internal_max_size: u32) -> bool {
    leaf_max_size >= 3
        && internal_max_size >= 4
        && LEAF_PAIRS_OFFSET + leaf_max_size as usize * leaf_slot_size::<K>() <= PAGE_SIZE
        && INTERNAL_PAIRS_OFFSET + internal_max_size as usize * internal_slot_size::<K>() <= PAGE_SIZE
}

/// Rewrite just the parent pointer of an encoded node.
pub(crate) fn write_parent_page_id(data: &mut [u8], parent_page_id: PageId) {
    LittleEndian::write_i32(&mut data[PARENT_OFFSET..PARENT_OFFSET + 4], parent_page_id);
}

/// Serialize a node into its page bytes.
pub fn encode_node<K: IndexKey>(node: &BTreeNode<K>, data: &mut [u8]) {
    debug_assert_eq!(data.len(), PAGE_SIZE);

    LittleEndian::write_u32(
        &mut data[PAGE_TYPE_OFFSET..PAGE_TYPE_OFFSET + 4],
        node.node_type as u32,
    );
    LittleEndian::write_u32(&mut data[LSN_OFFSET..LSN_OFFSET + 4], node.lsn);
    LittleEndian::write_u32(&mut data[SIZE_OFFSET..SIZE_OFFSET + 4], node.size() as u32);
    LittleEndian::write_u32(&mut data[MAX_SIZE_OFFSET..MAX_SIZE_OFFSET + 4], node.max_size);
    LittleEndian::write_i32(&mut data[PARENT_OFFSET..PARENT_OFFSET + 4], node.parent_page_id);
    LittleEndian::write_i32(&mut data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4], node.page_id);

    if node.is_leaf() {
        LittleEndian::write_i32(
            &mut data[NEXT_PAGE_OFFSET..NEXT_PAGE_OFFSET + 4],
            node.next_page_id,
        );
        let slot = leaf_slot_size::<K>();
        for (i, (key, rid)) in node.keys.iter().zip(node.rids.iter()).enumerate() {
            let offset = LEAF_PAIRS_OFFSET + i * slot;
            key.encode(&mut data[offset..offset + K::ENCODED_SIZE]);
            let value_offset = offset + K::ENCODED_SIZE;
            LittleEndian::write_i32(&mut data[value_offset..value_offset + 4], rid.page_id);
            LittleEndian::write_u32(&mut data[value_offset + 4..value_offset + 8], rid.slot_num);
        }
    } else {
        let slot = internal_slot_size::<K>();
        for (i, (key, child)) in node.keys.iter().zip(node.children.iter()).enumerate() {
            let offset = INTERNAL_PAIRS_OFFSET + i * slot;
            key.encode(&mut data[offset..offset + K::ENCODED_SIZE]);
            let value_offset = offset + K::ENCODED_SIZE;
            LittleEndian::write_i32(&mut data[value_offset..value_offset + 4], *child);
        }
    }
}

/// Deserialize a node from its page bytes.
pub fn decode_node<K: IndexKey>(data: &[u8]) -> Result<BTreeNode<K>, BTreeError> {
    debug_assert_eq!(data.len(), PAGE_SIZE);

    let page_id = LittleEndian::read_i32(&data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4]);
    let node_type = match LittleEndian::read_u32(&data[PAGE_TYPE_OFFSET..PAGE_TYPE_OFFSET + 4]) {
        1 => BTreeNodeType::Leaf,
        2 => BTreeNodeType::Internal,
        _ => return Err(BTreeError::InvalidPageFormat(page_id)),
    };
    let lsn = LittleEndian::read_u32(&data[LSN_OFFSET..LSN_OFFSET + 4]);
    let size = LittleEndian::read_u32(&data[SIZE_OFFSET..SIZE_OFFSET + 4]) as usize;
    let max_size = LittleEndian::read_u32(&data[MAX_SIZE_OFFSET..MAX_SIZE_OFFSET + 4]);
    let parent_page_id = LittleEndian::read_i32(&data[PARENT_OFFSET..PARENT_OFFSET + 4]);

    let mut node = match node_type {
        BTreeNodeType::Leaf => BTreeNode::new_leaf(page_id, parent_page_id, max_size),
        BTreeNodeType::Internal => BTreeNode::new_internal(page_id, parent_page_id, max_size),
    };
    node.lsn = lsn;

    if node.is_leaf() {
        let slot = leaf_slot_size::<K>();
        if LEAF_PAIRS_OFFSET + size * slot > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat(page_id));
        }
        node.next_page_id = LittleEndian::read_i32(&data[NEXT_PAGE_OFFSET..NEXT_PAGE_OFFSET + 4]);
        for i in 0..size {
            let offset = LEAF_PAIRS_OFFSET + i * slot;
            let key = K::decode(&data[offset..offset + K::ENCODED_SIZE]);
            let value_offset = offset + K::ENCODED_SIZE;
            let rid = Rid::new(
                LittleEndian::read_i32(&data[value_offset..value_offset + 4]),
                LittleEndian::read_u32(&data[value_offset + 4..value_offset + 8]),
            );
            node.leaf_push_back(key, rid);
        }
    } else {
        let slot = internal_slot_size::<K>();
        if INTERNAL_PAIRS_OFFSET + size * slot > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat(page_id));
        }
        for i in 0..size {
            let offset = INTERNAL_PAIRS_OFFSET + i * slot;
            let key = K::decode(&data[offset..offset + K::ENCODED_SIZE]);
            let value_offset = offset + K::ENCODED_SIZE;
            let child: PageId = LittleEndian::read_i32(&data[value_offset..value_offset + 4]);
            node.internal_push_back(key, child);
        }
    }

    Ok(node)
}
