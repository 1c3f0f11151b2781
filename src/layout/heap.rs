//! Trace Seed Priority Queue
//!
//! An indexed binary min-heap with stable handles: a slot vector plus a
//! handle → position map, giving O(log n) insert, extract-min,
//! decrease-key and delete. Handles are non-owning `u32` indices; the
//! block side table records which heap holds a block and under which
//! handle. Ties between equal keys break by insertion order, which is
//! observable in the resulting trace order, so it is part of the contract.

use crate::cfg::BlockId;

/// Identity of one heap instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapId(pub u32);

/// Handle of one entry, meaningful only for the heap that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(u32);

#[derive(Debug, Clone)]
struct Slot {
    key: i64,
    /// Insertion sequence; breaks key ties first-in-first-out.
    seq: u64,
    block: BlockId,
    handle: u32,
}

const NO_POS: u32 = u32::MAX;

#[derive(Debug)]
pub struct TraceHeap {
    id: HeapId,
    /// Heap array ordered by `(key, seq)`.
    slots: Vec<Slot>,
    /// Handle → position in `slots`, `NO_POS` when free.
    pos: Vec<u32>,
    free: Vec<u32>,
    next_seq: u64,
}

impl TraceHeap {
    pub fn new(id: HeapId) -> Self {
        TraceHeap { id, slots: Vec::new(), pos: Vec::new(), free: Vec::new(), next_seq: 0 }
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current key of a live entry.
    pub fn key(&self, h: NodeHandle) -> i64 {
        let at = self.pos[h.0 as usize];
        debug_assert_ne!(at, NO_POS);
        self.slots[at as usize].key
    }

    pub fn insert(&mut self, key: i64, block: BlockId) -> NodeHandle {
        let handle = match self.free.pop() {
            Some(h) => h,
            None => {
                self.pos.push(NO_POS);
                (self.pos.len() - 1) as u32
            }
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        let at = self.slots.len();
        self.slots.push(Slot { key, seq, block, handle });
        self.pos[handle as usize] = at as u32;
        self.sift_up(at);
        NodeHandle(handle)
    }

    /// Remove and return the block with the smallest key.
    pub fn extract_min(&mut self) -> Option<BlockId> {
        let block = self.slots.first()?.block;
        self.remove_at(0);
        Some(block)
    }

    /// Change the key of a live entry; heap order is restored either way,
    /// so this serves both decrease and increase.
    pub fn replace_key(&mut self, h: NodeHandle, key: i64) {
        let at = self.pos[h.0 as usize];
        debug_assert_ne!(at, NO_POS);
        let at = at as usize;
        let old = self.slots[at].key;
        self.slots[at].key = key;
        if key < old {
            self.sift_up(at);
        } else {
            self.sift_down(at);
        }
    }

    /// Remove a live entry regardless of its position.
    pub fn delete(&mut self, h: NodeHandle) {
        let at = self.pos[h.0 as usize];
        debug_assert_ne!(at, NO_POS);
        self.remove_at(at as usize);
    }

    fn remove_at(&mut self, at: usize) {
        let handle = self.slots[at].handle;
        self.pos[handle as usize] = NO_POS;
        self.free.push(handle);
        let last = self.slots.len() - 1;
        if at != last {
            self.slots.swap(at, last);
            self.pos[self.slots[at].handle as usize] = at as u32;
            self.slots.pop();
            // The displaced slot may need to move either way.
            self.sift_up(at);
            self.sift_down(at);
        } else {
            self.slots.pop();
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (sa, sb) = (&self.slots[a], &self.slots[b]);
        (sa.key, sa.seq) < (sb.key, sb.seq)
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 && self.less(at, (at - 1) / 2) {
            self.swap_slots(at, (at - 1) / 2);
            at = (at - 1) / 2;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let mut best = at;
            for child in [2 * at + 1, 2 * at + 2] {
                if child < self.slots.len() && self.less(child, best) {
                    best = child;
                }
            }
            if best == at {
                break;
            }
            self.swap_slots(at, best);
            at = best;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.pos[self.slots[a].handle as usize] = a as u32;
        self.pos[self.slots[b].handle as usize] = b as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_order_and_stable_ties() {
        let mut h = TraceHeap::new(HeapId(0));
        h.insert(5, BlockId(0));
        h.insert(-3, BlockId(1));
        h.insert(5, BlockId(2));
        assert_eq!(h.extract_min(), Some(BlockId(1)));
        // Equal keys drain in insertion order.
        assert_eq!(h.extract_min(), Some(BlockId(0)));
        assert_eq!(h.extract_min(), Some(BlockId(2)));
        assert_eq!(h.extract_min(), None);
        assert!(h.is_empty());
    }

    #[test]
    fn test_replace_key_reorders_both_ways() {
        let mut h = TraceHeap::new(HeapId(0));
        let a = h.insert(10, BlockId(0));
        let b = h.insert(5, BlockId(1));
        h.replace_key(a, -1);
        assert_eq!(h.key(a), -1);
        h.replace_key(b, 20);
        assert_eq!(h.extract_min(), Some(BlockId(0)));
        assert_eq!(h.extract_min(), Some(BlockId(1)));
    }

    #[test]
    fn test_delete_middle_and_handle_reuse() {
        let mut h = TraceHeap::new(HeapId(0));
        h.insert(1, BlockId(0));
        let b = h.insert(2, BlockId(1));
        h.insert(3, BlockId(2));
        h.delete(b);
        let c = h.insert(0, BlockId(3));
        assert_eq!(h.key(c), 0);
        assert_eq!(h.extract_min(), Some(BlockId(3)));
        assert_eq!(h.extract_min(), Some(BlockId(0)));
        assert_eq!(h.extract_min(), Some(BlockId(2)));
    }
}
