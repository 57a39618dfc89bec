use crate::manager::CacheEntry;
use std::sync::Arc;

pub const NIL_SLOT: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: usize,
    next: usize,
    in_use: bool,
}

/// Intrusive recency list backed by a slot arena. Links are indices, not
/// pointers, so the list never forms reference cycles and freed slots are
/// recycled instead of reallocated.
#[derive(Debug, Default)]
pub struct LruList {
    nodes: Vec<Node>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
    len: usize,
}

impl LruList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: NIL_SLOT,
            tail: NIL_SLOT,
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocates a slot and links it at the most-recent end.
    pub fn push_front(&mut self) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.nodes.push(Node {
                    prev: NIL_SLOT,
                    next: NIL_SLOT,
                    in_use: false,
                });
                self.nodes.len() - 1
            }
        };
        self.nodes[slot] = Node {
            prev: NIL_SLOT,
            next: self.head,
            in_use: true,
        };
        if self.head != NIL_SLOT {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL_SLOT {
            self.tail = slot;
        }
        self.len += 1;
        slot
    }

    fn unlink(&mut self, slot: usize) {
        let node = self.nodes[slot];
        debug_assert!(node.in_use);
        if node.prev != NIL_SLOT {
            self.nodes[node.prev].next = node.next;
        } else {
            self.head = node.next;
        }
        if node.next != NIL_SLOT {
            self.nodes[node.next].prev = node.prev;
        } else {
            self.tail = node.prev;
        }
    }

    /// Relinks an existing slot at the most-recent end.
    pub fn touch(&mut self, slot: usize) {
        if slot == self.head {
            return;
        }
        self.unlink(slot);
        let head = self.head;
        self.nodes[slot] = Node {
            prev: NIL_SLOT,
            next: head,
            in_use: true,
        };
        if head != NIL_SLOT {
            self.nodes[head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL_SLOT {
            self.tail = slot;
        }
    }

    /// Unlinks the slot and returns it to the free pool.
    pub fn remove(&mut self, slot: usize) {
        self.unlink(slot);
        self.nodes[slot].in_use = false;
        self.free.push(slot);
        self.len -= 1;
    }

    /// Least-recently-used slot, if any.
    pub fn tail_slot(&self) -> Option<usize> {
        if self.tail == NIL_SLOT {
            None
        } else {
            Some(self.tail)
        }
    }

    /// Next slot toward the most-recent end, for skip-scans over pinned
    /// entries.
    pub fn toward_front(&self, slot: usize) -> Option<usize> {
        let prev = self.nodes[slot].prev;
        if prev == NIL_SLOT {
            None
        } else {
            Some(prev)
        }
    }
}

/// Recency index over live cache entries plus the byte total they occupy on
/// disk. Guarded by its own mutex in the manager; it never takes other
/// locks, so it sits at the bottom of the lock order.
#[derive(Default)]
pub struct EvictionIndex {
    list: LruList,
    entries: Vec<Option<Arc<CacheEntry>>>,
    total_bytes: u64,
}

impl EvictionIndex {
    pub fn new() -> Self {
        Self {
            list: LruList::new(),
            entries: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn insert(&mut self, entry: Arc<CacheEntry>) {
        let slot = self.list.push_front();
        if slot >= self.entries.len() {
            self.entries.resize_with(slot + 1, || None);
        }
        entry.set_slot(slot);
        self.entries[slot] = Some(entry);
    }

    pub fn touch(&mut self, entry: &CacheEntry) {
        let slot = entry.slot();
        if slot != NIL_SLOT {
            self.list.touch(slot);
        }
    }

    /// Drops the entry from the index and deducts its bytes. Safe to call
    /// for entries already removed.
    pub fn remove(&mut self, entry: &CacheEntry) {
        let slot = entry.slot();
        if slot == NIL_SLOT {
            return;
        }
        if self.entries.get(slot).map_or(false, |e| e.is_some()) {
            self.entries[slot] = None;
            self.list.remove(slot);
            self.total_bytes = self.total_bytes.saturating_sub(entry.take_index_bytes());
        }
        entry.set_slot(NIL_SLOT);
    }

    /// Charges newly committed bytes against the total. A no-op for an
    /// entry no longer in the index, so a commit racing a removal cannot
    /// leave the total holding bytes nothing will ever subtract.
    pub fn add_bytes(&mut self, entry: &CacheEntry, delta: u64) {
        let slot = entry.slot();
        if slot == NIL_SLOT || !self.entries.get(slot).map_or(false, |e| e.is_some()) {
            return;
        }
        entry.add_index_bytes(delta);
        self.total_bytes += delta;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Removes and returns the least-recently-used entry with no active
    /// readers. Pinned entries are skipped, not unpinned; they come up for
    /// eviction again once their readers close.
    pub fn pop_lru_unpinned(&mut self) -> Option<Arc<CacheEntry>> {
        let mut cursor = self.list.tail_slot();
        while let Some(slot) = cursor {
            let pinned = match &self.entries[slot] {
                Some(entry) => entry.reader_count() > 0,
                None => false,
            };
            if !pinned {
                if let Some(entry) = self.entries[slot].take() {
                    self.list.remove(slot);
                    self.total_bytes = self.total_bytes.saturating_sub(entry.take_index_bytes());
                    entry.set_slot(NIL_SLOT);
                    return Some(entry);
                }
            }
            cursor = self.list.toward_front(slot);
        }
        None
    }
}
