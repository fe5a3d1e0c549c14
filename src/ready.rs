//! Priority Ready Structures
//!
//! The per-instance sets of runnable threads. Two variants behind one
//! closed dispatch enum:
//!
//! - [`BitmapQueue`]: a two-level bitmap over 256 fixed priorities with one
//!   intrusive FIFO per priority. `highest_ready` is a pair of
//!   trailing-zeros scans - O(1).
//! - [`EdfQueue`]: an index min-heap keyed by absolute deadline for
//!   earliest-deadline-first instances - O(log n).
//!
//! Both store their link cells internally (indexed by thread slot), so the
//! structures are self-contained: no pointers into the thread arena.
//!
//! `enqueue` appends among equal keys (FIFO for new arrivals);
//! `enqueue_first` prepends, used when a thread is *returned* to the ready
//! set so it does not lose its place to same-priority peers.

use crate::config::{MAX_THREADS, PRIORITY_COUNT};
use crate::error::{fatal, FatalCode};

/// Sort key: the priority value for bitmap instances, the absolute deadline
/// for EDF instances. Lower is more urgent in both.
pub type SortKey = u64;

const NIL: u16 = u16::MAX;

// ============================================================================
// Two-Level Bitmap Queue
// ============================================================================

const GROUP_BITS: usize = 64;
const GROUPS: usize = PRIORITY_COUNT / GROUP_BITS;

#[derive(Clone, Copy)]
struct Link {
    prev: u16,
    next: u16,
    prio: u8,
    queued: bool,
}

const EMPTY_LINK: Link = Link {
    prev: NIL,
    next: NIL,
    prio: 0,
    queued: false,
};

/// Bitmap-indexed ready queue: one FIFO per priority, a minor bitmap word
/// per 64 priorities, and a major word indexing non-empty minors.
pub struct BitmapQueue {
    major: u64,
    minors: [u64; GROUPS],
    heads: [u16; PRIORITY_COUNT],
    tails: [u16; PRIORITY_COUNT],
    links: [Link; MAX_THREADS],
    len: usize,
}

impl BitmapQueue {
    pub const fn new() -> Self {
        Self {
            major: 0,
            minors: [0; GROUPS],
            heads: [NIL; PRIORITY_COUNT],
            tails: [NIL; PRIORITY_COUNT],
            links: [EMPTY_LINK; MAX_THREADS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_queued(&self, slot: usize) -> bool {
        self.links[slot].queued
    }

    fn set_bits(&mut self, prio: usize) {
        let group = prio / GROUP_BITS;
        self.minors[group] |= 1u64 << (prio % GROUP_BITS);
        self.major |= 1u64 << group;
    }

    fn clear_bits_if_empty(&mut self, prio: usize) {
        if self.heads[prio] == NIL {
            let group = prio / GROUP_BITS;
            self.minors[group] &= !(1u64 << (prio % GROUP_BITS));
            if self.minors[group] == 0 {
                self.major &= !(1u64 << group);
            }
        }
    }

    fn begin_insert(&mut self, slot: usize, key: SortKey) -> usize {
        debug_assert!((key as usize) < PRIORITY_COUNT);
        if self.links[slot].queued {
            fatal(FatalCode::DoubleEnqueue);
        }
        key as usize
    }

    /// FIFO-append at the thread's priority.
    pub fn enqueue(&mut self, slot: usize, key: SortKey) {
        let prio = self.begin_insert(slot, key);
        let tail = self.tails[prio];
        self.links[slot] = Link {
            prev: tail,
            next: NIL,
            prio: prio as u8,
            queued: true,
        };
        if tail == NIL {
            self.heads[prio] = slot as u16;
        } else {
            self.links[tail as usize].next = slot as u16;
        }
        self.tails[prio] = slot as u16;
        self.set_bits(prio);
        self.len += 1;
    }

    /// LIFO-prepend at the thread's priority (return to the ready set
    /// without losing position to same-priority peers).
    pub fn enqueue_first(&mut self, slot: usize, key: SortKey) {
        let prio = self.begin_insert(slot, key);
        let head = self.heads[prio];
        self.links[slot] = Link {
            prev: NIL,
            next: head,
            prio: prio as u8,
            queued: true,
        };
        if head == NIL {
            self.tails[prio] = slot as u16;
        } else {
            self.links[head as usize].prev = slot as u16;
        }
        self.heads[prio] = slot as u16;
        self.set_bits(prio);
        self.len += 1;
    }

    /// Remove a thread from its FIFO. Returns false if it was not queued.
    pub fn extract(&mut self, slot: usize) -> bool {
        let link = self.links[slot];
        if !link.queued {
            return false;
        }
        let prio = link.prio as usize;
        if link.prev == NIL {
            self.heads[prio] = link.next;
        } else {
            self.links[link.prev as usize].next = link.next;
        }
        if link.next == NIL {
            self.tails[prio] = link.prev;
        } else {
            self.links[link.next as usize].prev = link.prev;
        }
        self.links[slot] = EMPTY_LINK;
        self.clear_bits_if_empty(prio);
        self.len -= 1;
        true
    }

    /// Head of the highest-priority non-empty FIFO.
    pub fn highest_ready(&self) -> Option<usize> {
        if self.major == 0 {
            return None;
        }
        let group = self.major.trailing_zeros() as usize;
        let bit = self.minors[group].trailing_zeros() as usize;
        let prio = group * GROUP_BITS + bit;
        debug_assert_ne!(self.heads[prio], NIL);
        Some(self.heads[prio] as usize)
    }
}

// ============================================================================
// EDF Queue
// ============================================================================

#[derive(Clone, Copy)]
struct EdfNode {
    key: SortKey,
    seq: i64,
    /// Position in the heap array while queued
    pos: u16,
    queued: bool,
}

const EMPTY_EDF: EdfNode = EdfNode {
    key: 0,
    seq: 0,
    pos: NIL,
    queued: false,
};

/// Earliest-deadline-first ready queue.
///
/// Index min-heap over (deadline, sequence); the sequence breaks ties so
/// equal deadlines behave FIFO, and `enqueue_first` issues sequences from a
/// decreasing counter to prepend among equals.
pub struct EdfQueue {
    nodes: [EdfNode; MAX_THREADS],
    heap: [u16; MAX_THREADS],
    len: usize,
    back_seq: i64,
    front_seq: i64,
}

impl EdfQueue {
    pub const fn new() -> Self {
        Self {
            nodes: [EMPTY_EDF; MAX_THREADS],
            heap: [NIL; MAX_THREADS],
            len: 0,
            back_seq: 0,
            front_seq: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_queued(&self, slot: usize) -> bool {
        self.nodes[slot].queued
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let na = &self.nodes[self.heap[a] as usize];
        let nb = &self.nodes[self.heap[b] as usize];
        (na.key, na.seq) < (nb.key, nb.seq)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.nodes[self.heap[a] as usize].pos = a as u16;
        self.nodes[self.heap[b] as usize].pos = b as u16;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.less(i, parent) {
                self.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.len && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn insert(&mut self, slot: usize, key: SortKey, seq: i64) {
        if self.nodes[slot].queued {
            fatal(FatalCode::DoubleEnqueue);
        }
        let pos = self.len;
        self.nodes[slot] = EdfNode {
            key,
            seq,
            pos: pos as u16,
            queued: true,
        };
        self.heap[pos] = slot as u16;
        self.len += 1;
        self.sift_up(pos);
    }

    /// Insert behind equal deadlines (new arrival).
    pub fn enqueue(&mut self, slot: usize, key: SortKey) {
        let seq = self.back_seq;
        self.back_seq += 1;
        self.insert(slot, key, seq);
    }

    /// Insert ahead of equal deadlines (returned to the ready set).
    pub fn enqueue_first(&mut self, slot: usize, key: SortKey) {
        let seq = self.front_seq;
        self.front_seq -= 1;
        self.insert(slot, key, seq);
    }

    /// Remove a thread. Returns false if it was not queued.
    pub fn extract(&mut self, slot: usize) -> bool {
        if !self.nodes[slot].queued {
            return false;
        }
        let pos = self.nodes[slot].pos as usize;
        self.len -= 1;
        let last = self.len;
        if pos != last {
            self.heap[pos] = self.heap[last];
            self.nodes[self.heap[pos] as usize].pos = pos as u16;
            self.sift_down(pos);
            self.sift_up(pos);
        }
        self.heap[last] = NIL;
        self.nodes[slot] = EMPTY_EDF;
        true
    }

    /// The thread with the earliest deadline.
    pub fn highest_ready(&self) -> Option<usize> {
        (self.len > 0).then(|| self.heap[0] as usize)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// The per-instance ready structure: a closed set of orderings selected at
/// instance construction.
pub enum ReadyStructure {
    Bitmap(BitmapQueue),
    Edf(EdfQueue),
}

impl ReadyStructure {
    pub fn enqueue(&mut self, slot: usize, key: SortKey) {
        match self {
            ReadyStructure::Bitmap(q) => q.enqueue(slot, key),
            ReadyStructure::Edf(q) => q.enqueue(slot, key),
        }
    }

    pub fn enqueue_first(&mut self, slot: usize, key: SortKey) {
        match self {
            ReadyStructure::Bitmap(q) => q.enqueue_first(slot, key),
            ReadyStructure::Edf(q) => q.enqueue_first(slot, key),
        }
    }

    pub fn extract(&mut self, slot: usize) -> bool {
        match self {
            ReadyStructure::Bitmap(q) => q.extract(slot),
            ReadyStructure::Edf(q) => q.extract(slot),
        }
    }

    pub fn highest_ready(&self) -> Option<usize> {
        match self {
            ReadyStructure::Bitmap(q) => q.highest_ready(),
            ReadyStructure::Edf(q) => q.highest_ready(),
        }
    }

    pub fn is_queued(&self, slot: usize) -> bool {
        match self {
            ReadyStructure::Bitmap(q) => q.is_queued(slot),
            ReadyStructure::Edf(q) => q.is_queued(slot),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ReadyStructure::Bitmap(q) => q.is_empty(),
            ReadyStructure::Edf(q) => q.is_empty(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_highest_ready_order() {
        let mut q = BitmapQueue::new();
        q.enqueue(0, 200);
        q.enqueue(1, 5);
        q.enqueue(2, 63);
        q.enqueue(3, 64);

        assert_eq!(q.highest_ready(), Some(1));
        q.extract(1);
        assert_eq!(q.highest_ready(), Some(2));
        q.extract(2);
        assert_eq!(q.highest_ready(), Some(3));
        q.extract(3);
        assert_eq!(q.highest_ready(), Some(0));
        q.extract(0);
        assert_eq!(q.highest_ready(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_bitmap_fifo_within_priority() {
        let mut q = BitmapQueue::new();
        q.enqueue(7, 10);
        q.enqueue(3, 10);
        q.enqueue(9, 10);

        assert_eq!(q.highest_ready(), Some(7));
        q.extract(7);
        assert_eq!(q.highest_ready(), Some(3));
        q.extract(3);
        assert_eq!(q.highest_ready(), Some(9));
    }

    #[test]
    fn test_bitmap_enqueue_first_preserves_position() {
        let mut q = BitmapQueue::new();
        q.enqueue(1, 10);
        q.enqueue(2, 10);
        q.enqueue(3, 10);

        // Thread 1 leaves and is returned to the ready set - it must go
        // back to the front, not behind 2 and 3.
        q.extract(1);
        q.enqueue_first(1, 10);
        assert_eq!(q.highest_ready(), Some(1));
    }

    #[test]
    fn test_bitmap_extract_middle() {
        let mut q = BitmapQueue::new();
        q.enqueue(1, 10);
        q.enqueue(2, 10);
        q.enqueue(3, 10);
        assert!(q.extract(2));
        assert_eq!(q.highest_ready(), Some(1));
        q.extract(1);
        assert_eq!(q.highest_ready(), Some(3));
    }

    #[test]
    fn test_bitmap_extract_not_queued() {
        let mut q = BitmapQueue::new();
        assert!(!q.extract(5));
    }

    #[test]
    #[should_panic(expected = "double_enqueue")]
    fn test_bitmap_double_enqueue_is_fatal() {
        let mut q = BitmapQueue::new();
        q.enqueue(1, 10);
        q.enqueue(1, 20);
    }

    #[test]
    fn test_bitmap_bits_clear_on_empty() {
        let mut q = BitmapQueue::new();
        q.enqueue(1, 100);
        q.enqueue(2, 100);
        q.extract(1);
        // Priority 100 still occupied
        assert_eq!(q.highest_ready(), Some(2));
        q.extract(2);
        assert_eq!(q.highest_ready(), None);
    }

    #[test]
    fn test_edf_deadline_order() {
        let mut q = EdfQueue::new();
        q.enqueue(0, 3000);
        q.enqueue(1, 1000);
        q.enqueue(2, 2000);

        assert_eq!(q.highest_ready(), Some(1));
        q.extract(1);
        assert_eq!(q.highest_ready(), Some(2));
        q.extract(2);
        assert_eq!(q.highest_ready(), Some(0));
    }

    #[test]
    fn test_edf_fifo_on_equal_deadline() {
        let mut q = EdfQueue::new();
        q.enqueue(5, 1000);
        q.enqueue(6, 1000);
        q.enqueue(7, 1000);

        assert_eq!(q.highest_ready(), Some(5));
        q.extract(5);
        assert_eq!(q.highest_ready(), Some(6));
        q.extract(6);
        assert_eq!(q.highest_ready(), Some(7));
    }

    #[test]
    fn test_edf_enqueue_first_preempts_equals() {
        let mut q = EdfQueue::new();
        q.enqueue(1, 1000);
        q.enqueue(2, 1000);
        q.extract(1);
        q.enqueue_first(1, 1000);
        assert_eq!(q.highest_ready(), Some(1));
    }

    #[test]
    fn test_edf_extract_rebalances() {
        let mut q = EdfQueue::new();
        for (slot, key) in [(0, 50), (1, 40), (2, 30), (3, 20), (4, 10)] {
            q.enqueue(slot, key);
        }
        assert!(q.extract(2));
        assert_eq!(q.highest_ready(), Some(4));
        q.extract(4);
        assert_eq!(q.highest_ready(), Some(3));
        q.extract(3);
        assert_eq!(q.highest_ready(), Some(1));
        q.extract(1);
        assert_eq!(q.highest_ready(), Some(0));
    }

    #[test]
    fn test_ready_structure_dispatch() {
        let mut r = ReadyStructure::Bitmap(BitmapQueue::new());
        r.enqueue(4, 9);
        assert!(r.is_queued(4));
        assert_eq!(r.highest_ready(), Some(4));
        assert!(r.extract(4));
        assert!(r.is_empty());

        let mut r = ReadyStructure::Edf(EdfQueue::new());
        r.enqueue(4, 900);
        assert_eq!(r.highest_ready(), Some(4));
    }
}
