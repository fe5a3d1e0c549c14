//! Priority Inheritance Engine
//!
//! Maintains, per mutex holder, the list of priority contributions from
//! blocked waiters and recomputes the holder's effective priority.
//!
//! Each thread embeds exactly one [`PriorityNode`] - a thread can block on
//! at most one mutex at a time, so one contribution per thread suffices
//! (the original's statically-pooled nodes collapse to this). The node is
//! owned by the blocked thread and *linked* into the holder's list by slot
//! index; the list is kept sorted with the highest contributed priority
//! (numerically lowest) at the head, so the holder's inherited priority is
//! a head read.
//!
//! [`evaluate_chain`] propagates across nested ownership: if a holder whose
//! priority just rose is itself blocked on another mutex, its contribution
//! to that mutex's holder is repositioned and the walk continues. The walk
//! is bounded by nesting depth; cyclic waits cannot arise because a thread
//! blocks on one mutex at a time and callers never create ownership cycles.

use crate::error::{fatal, FatalCode};
use crate::mutex::{MutexArena, MutexId};
use crate::thread::{BlockReason, Priority, ThreadArena};

/// One thread's contribution to a mutex holder's inherited priority.
#[derive(Debug, Clone, Copy)]
pub struct PriorityNode {
    /// Contributed priority (the blocked thread's effective priority)
    pub(crate) priority: Priority,
    /// The mutex this contribution is tagged with
    pub(crate) mutex: Option<MutexId>,
    /// Slot of the holder whose list carries this node
    pub(crate) holder: Option<u16>,
    pub(crate) prev: Option<u16>,
    pub(crate) next: Option<u16>,
}

impl PriorityNode {
    pub const fn new() -> Self {
        Self {
            priority: 0,
            mutex: None,
            holder: None,
            prev: None,
            next: None,
        }
    }

    /// Whether the node is currently linked into a holder's list
    pub fn is_linked(&self) -> bool {
        self.mutex.is_some()
    }
}

/// Effective-priority changes produced by an inheritance walk, to be applied
/// to the scheduler by the caller.
pub struct PriorityUpdates {
    items: [(u16, Priority); crate::config::MAX_THREADS],
    len: usize,
}

impl PriorityUpdates {
    pub const fn new() -> Self {
        Self {
            items: [(0, 0); crate::config::MAX_THREADS],
            len: 0,
        }
    }

    fn push(&mut self, slot: u16, prio: Priority) {
        // Each chain step is a distinct thread, so the walk cannot outgrow
        // the arena
        self.items[self.len] = (slot, prio);
        self.len += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, Priority)> + '_ {
        self.items[..self.len].iter().copied()
    }
}

/// Link `waiter`'s node into `holder`'s inheritance list with contribution
/// `prio`, tagged with `mutex`. Returns true if the node became the list
/// head - the holder's effective priority may need to rise.
pub fn enqueue_priority_node(
    threads: &mut ThreadArena,
    waiter: usize,
    holder: usize,
    mutex: MutexId,
    prio: Priority,
) -> bool {
    if threads.at(waiter).map(|t| t.pnode.is_linked()) != Some(false) {
        fatal(FatalCode::StateCorruption);
    }

    // Find the insert position: after every contribution at least as good
    // (numerically <=), so equals stay in arrival order.
    let mut prev: Option<u16> = None;
    let mut cur = match threads.at(holder) {
        Some(t) => t.inherit_head,
        None => fatal(FatalCode::StateCorruption),
    };
    while let Some(c) = cur {
        let node = &threads.at(c as usize).expect("linked slot").pnode;
        if node.priority > prio {
            break;
        }
        prev = cur;
        cur = node.next;
    }

    {
        let w = threads.at_mut(waiter).expect("waiter slot");
        w.pnode.priority = prio;
        w.pnode.mutex = Some(mutex);
        w.pnode.holder = Some(holder as u16);
        w.pnode.prev = prev;
        w.pnode.next = cur;
    }
    match prev {
        None => threads.at_mut(holder).expect("holder slot").inherit_head = Some(waiter as u16),
        Some(p) => threads.at_mut(p as usize).expect("prev slot").pnode.next = Some(waiter as u16),
    }
    if let Some(c) = cur {
        threads.at_mut(c as usize).expect("next slot").pnode.prev = Some(waiter as u16);
    }

    prev.is_none()
}

/// Unlink `waiter`'s node from its holder's list. Idempotent; returns false
/// if the node was not linked.
pub fn dequeue_priority_node(threads: &mut ThreadArena, waiter: usize) -> bool {
    let (holder, prev, next) = {
        let Some(t) = threads.at(waiter) else {
            return false;
        };
        if !t.pnode.is_linked() {
            return false;
        }
        let Some(holder) = t.pnode.holder else {
            fatal(FatalCode::StateCorruption);
        };
        (holder, t.pnode.prev, t.pnode.next)
    };

    match prev {
        None => threads.at_mut(holder as usize).expect("holder slot").inherit_head = next,
        Some(p) => threads.at_mut(p as usize).expect("prev slot").pnode.next = next,
    }
    if let Some(n) = next {
        threads.at_mut(n as usize).expect("next slot").pnode.prev = prev;
    }

    let w = threads.at_mut(waiter).expect("waiter slot");
    w.pnode.mutex = None;
    w.pnode.holder = None;
    w.pnode.prev = None;
    w.pnode.next = None;
    true
}

/// Recompute `start`'s effective priority and propagate along the chain of
/// mutex ownership. Returns every (slot, new effective priority) pair the
/// walk changed, for the caller to apply to scheduler keys and non-mutex
/// wait queues.
pub fn evaluate_chain(
    threads: &mut ThreadArena,
    mutexes: &mut MutexArena,
    start: usize,
) -> PriorityUpdates {
    let mut updates = PriorityUpdates::new();
    let mut slot = start;
    loop {
        let (real, current, head) = {
            let t = threads.at(slot).expect("chain slot");
            (t.real_priority(), t.current_priority(), t.inherit_head)
        };
        let inherited = head.map(|h| threads.at(h as usize).expect("head slot").pnode.priority);
        let effective = match inherited {
            Some(p) => p.min(real),
            None => real,
        };
        if effective == current {
            break;
        }

        threads
            .at_mut(slot)
            .expect("chain slot")
            .set_current_priority(effective);
        updates.push(slot as u16, effective);
        crate::ktrace!("inherit", "effective_changed";
            slot = slot, from = current as u64, to = effective as u64);

        // If this thread is itself blocked on a mutex, its contribution to
        // that mutex's holder changes too - reposition and walk on.
        let reason = threads.at(slot).expect("chain slot").state().block_reason();
        let Some(BlockReason::Mutex(m)) = reason else {
            break;
        };
        let Some(holder) = threads.at(slot).expect("chain slot").pnode.holder else {
            fatal(FatalCode::StateCorruption);
        };
        let tid = threads.at(slot).expect("chain slot").id;
        dequeue_priority_node(threads, slot);
        enqueue_priority_node(threads, slot, holder as usize, m, effective);
        if let Some(mx) = mutexes.get_mut(m) {
            mx.queue.requeue(tid, effective);
        }
        slot = holder as usize;
    }
    updates
}

/// Strip every contribution tagged with `mutex` from `holder`'s list.
/// Called on release; the caller re-evaluates the holder afterwards.
pub fn release_inherited(threads: &mut ThreadArena, holder: usize, mutex: MutexId) {
    let mut cur = threads.at(holder).expect("holder slot").inherit_head;
    while let Some(c) = cur {
        let node = &threads.at(c as usize).expect("linked slot").pnode;
        let next = node.next;
        if node.mutex == Some(mutex) {
            dequeue_priority_node(threads, c as usize);
        }
        cur = next;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::BlockReason;

    fn setup() -> (ThreadArena, MutexArena, MutexId) {
        let mut threads = ThreadArena::new();
        let mut mutexes = MutexArena::new();
        let m = mutexes.create().unwrap();
        // Slot 0: holder, slots 1..: waiters
        for (name, prio) in [("holder", 15), ("w1", 5), ("w2", 10), ("w3", 12)] {
            let id = threads.create(name, prio, 0).unwrap();
            threads.get_mut(id).unwrap().start().unwrap();
        }
        (threads, mutexes, m)
    }

    #[test]
    fn test_head_tracks_highest_contribution() {
        let (mut threads, _mutexes, m) = setup();

        // Lowest-urgency contribution first
        assert!(enqueue_priority_node(&mut threads, 3, 0, m, 12));
        // Better priority takes the head
        assert!(enqueue_priority_node(&mut threads, 1, 0, m, 5));
        // Middle priority lands between - not a new head
        assert!(!enqueue_priority_node(&mut threads, 2, 0, m, 10));

        let head = threads.at(0).unwrap().inherit_head;
        assert_eq!(head, Some(1));
    }

    #[test]
    fn test_equal_contributions_keep_arrival_order() {
        let (mut threads, _mutexes, m) = setup();
        assert!(enqueue_priority_node(&mut threads, 1, 0, m, 10));
        assert!(!enqueue_priority_node(&mut threads, 2, 0, m, 10));
        assert_eq!(threads.at(0).unwrap().inherit_head, Some(1));
    }

    #[test]
    fn test_inheritance_bound() {
        let (mut threads, mut mutexes, m) = setup();
        // Waiters of priority 12, 10, 5 block successively; the holder's
        // effective priority must track the best of them.
        for (slot, prio) in [(3usize, 12u8), (2, 10), (1, 5)] {
            enqueue_priority_node(&mut threads, slot, 0, m, prio);
            evaluate_chain(&mut threads, &mut mutexes, 0);
        }
        assert_eq!(threads.at(0).unwrap().current_priority(), 5);
        assert_eq!(threads.at(0).unwrap().real_priority(), 15);
    }

    #[test]
    fn test_release_restores_real_priority() {
        let (mut threads, mut mutexes, m) = setup();
        enqueue_priority_node(&mut threads, 1, 0, m, 5);
        evaluate_chain(&mut threads, &mut mutexes, 0);
        assert_eq!(threads.at(0).unwrap().current_priority(), 5);

        release_inherited(&mut threads, 0, m);
        let updates = evaluate_chain(&mut threads, &mut mutexes, 0);
        assert_eq!(threads.at(0).unwrap().current_priority(), 15);
        assert!(!updates.is_empty());
    }

    #[test]
    fn test_dequeue_is_idempotent() {
        let (mut threads, _mutexes, m) = setup();
        enqueue_priority_node(&mut threads, 1, 0, m, 5);
        assert!(dequeue_priority_node(&mut threads, 1));
        assert!(!dequeue_priority_node(&mut threads, 1));
        assert_eq!(threads.at(0).unwrap().inherit_head, None);
    }

    #[test]
    fn test_nested_chain_propagation() {
        // t2 (prio 20) holds m2; t1 (prio 10) holds m1 and blocks on m2;
        // t0 (prio 3) blocks on m1. The boost must reach t2.
        let mut threads = ThreadArena::new();
        let mut mutexes = MutexArena::new();
        let m1 = mutexes.create().unwrap();
        let m2 = mutexes.create().unwrap();

        let t0 = threads.create("t0", 3, 0).unwrap();
        let t1 = threads.create("t1", 10, 0).unwrap();
        let t2 = threads.create("t2", 20, 0).unwrap();
        for id in [t0, t1, t2] {
            threads.get_mut(id).unwrap().start().unwrap();
        }
        mutexes.get_mut(m1).unwrap().holder = Some(t1.slot);
        mutexes.get_mut(m2).unwrap().holder = Some(t2.slot);

        // t1 blocks on m2 and contributes its current priority (10)
        threads
            .get_mut(t1)
            .unwrap()
            .block(BlockReason::Mutex(m2))
            .unwrap();
        mutexes.get_mut(m2).unwrap().queue.enqueue(t1, 10);
        enqueue_priority_node(&mut threads, t1.slot(), t2.slot(), m2, 10);
        evaluate_chain(&mut threads, &mut mutexes, t2.slot());
        assert_eq!(threads.get(t2).unwrap().current_priority(), 10);

        // t0 blocks on m1 - the boost walks through t1 into t2
        threads
            .get_mut(t0)
            .unwrap()
            .block(BlockReason::Mutex(m1))
            .unwrap();
        enqueue_priority_node(&mut threads, t0.slot(), t1.slot(), m1, 3);
        let updates = evaluate_chain(&mut threads, &mut mutexes, t1.slot());

        assert_eq!(threads.get(t1).unwrap().current_priority(), 3);
        assert_eq!(threads.get(t2).unwrap().current_priority(), 3);
        let changed: std::vec::Vec<_> = updates.iter().collect();
        assert_eq!(changed, std::vec![(t1.slot, 3), (t2.slot, 3)]);
    }

    #[test]
    fn test_release_strips_only_tagged_nodes() {
        let mut threads = ThreadArena::new();
        let mut mutexes = MutexArena::new();
        let ma = mutexes.create().unwrap();
        let mb = mutexes.create().unwrap();

        let holder = threads.create("holder", 30, 0).unwrap();
        let wa = threads.create("wa", 8, 0).unwrap();
        let wb = threads.create("wb", 4, 0).unwrap();
        for id in [holder, wa, wb] {
            threads.get_mut(id).unwrap().start().unwrap();
        }

        enqueue_priority_node(&mut threads, wa.slot(), holder.slot(), ma, 8);
        enqueue_priority_node(&mut threads, wb.slot(), holder.slot(), mb, 4);
        evaluate_chain(&mut threads, &mut mutexes, holder.slot());
        assert_eq!(threads.get(holder).unwrap().current_priority(), 4);

        // Releasing mb drops only wb's contribution; wa's remains
        release_inherited(&mut threads, holder.slot(), mb);
        evaluate_chain(&mut threads, &mut mutexes, holder.slot());
        assert_eq!(threads.get(holder).unwrap().current_priority(), 8);
    }
}
