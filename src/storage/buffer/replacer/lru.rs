use parking_lot::Mutex;

use crate::common::types::FrameId;

#[derive(Clone, Copy)]
struct Node {
    prev: usize,
    next: usize,
    linked: bool,
}

struct LruList {
    // nodes[capacity] is the sentinel; a frame is victimizable iff linked
    nodes: Vec<Node>,
    size: usize,
}

/// LRU replacement policy over buffer pool frames.
///
/// Implemented as an intrusive doubly-linked list with a sentinel head and
/// one preallocated node per frame, so pin/unpin/victim never allocate.
/// `head.next` is the MRU end, `head.prev` the LRU end.
pub struct LruReplacer {
    capacity: usize,
    inner: Mutex<LruList>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        let sentinel = capacity;
        let mut nodes = vec![
            Node {
                prev: sentinel,
                next: sentinel,
                linked: false,
            };
            capacity + 1
        ];
        nodes[sentinel].linked = true;
        Self {
            capacity,
            inner: Mutex::new(LruList { nodes, size: 0 }),
        }
    }

    /// Remove and return the least-recently-used frame, if any.
    pub fn victim(&self) -> Option<FrameId> {
        let mut list = self.inner.lock();
        let sentinel = self.capacity;
        let lru = list.nodes[sentinel].prev;
        if lru == sentinel {
            return None;
        }
        Self::unlink(&mut list, lru);
        Some(lru)
    }

    /// A pinned frame must not be victimized; no-op if not linked.
    pub fn pin(&self, frame_id: FrameId) {
        debug_assert!(frame_id < self.capacity);
        let mut list = self.inner.lock();
        if list.nodes[frame_id].linked {
            Self::unlink(&mut list, frame_id);
        }
    }

    /// Make a frame victimizable again, inserting at the MRU end; no-op if
    /// already linked.
    pub fn unpin(&self, frame_id: FrameId) {
        debug_assert!(frame_id < self.capacity);
        let sentinel = self.capacity;
        let mut list = self.inner.lock();
        if list.nodes[frame_id].linked {
            return;
        }
        let old_mru = list.nodes[sentinel].next;
        list.nodes[frame_id] = Node {
            prev: sentinel,
            next: old_mru,
            linked: true,
        };
        list.nodes[old_mru].prev = frame_id;
        list.nodes[sentinel].next = frame_id;
        list.size += 1;
    }

    /// Number of victimizable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    fn unlink(list: &mut LruList, frame_id: usize) {
        let Node { prev, next, .. } = list.nodes[frame_id];
        list.nodes[prev].next = next;
        list.nodes[next].prev = prev;
        list.nodes[frame_id].linked = false;
        list.nodes[frame_id].prev = frame_id;
        list.nodes[frame_id].next = frame_id;
        list.size -= 1;
    }
}
