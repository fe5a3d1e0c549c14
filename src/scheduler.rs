//! SMP Scheduler
//!
//! Composes a per-instance ready structure with a Scheduled set sized to
//! the instance's processor count. Each attached thread's node is in one of
//! three states:
//!
//! ```text
//!              unblock                    highest urgency
//! NotScheduled ───────► Ready ◄─────────────► Scheduled
//!      ▲                  │   move_ready_to_scheduled /
//!      └──────block───────┘   move_scheduled_to_ready
//! ```
//!
//! On every eligibility event (block, unblock, yield, key change) the
//! instance decides which threads occupy its processors. A displaced
//! incumbent returns to the ready structure with `enqueue_first` so it does
//! not lose its place among same-priority peers; processors whose occupant
//! changed are marked for dispatch - the context switch itself belongs to
//! the out-of-scope dispatcher.
//!
//! Preemption is strict: an arrival displaces the worst Scheduled thread
//! only if its key is strictly more urgent.

use crate::config::{MAX_CPUS, MAX_THREADS, SchedPolicy};
use crate::error::{fatal, FatalCode};
use crate::ready::{BitmapQueue, EdfQueue, ReadyStructure, SortKey};

/// Where a thread's scheduler node currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Blocked or dormant; in neither set
    NotScheduled,
    /// In the ready structure, waiting for a processor
    Ready,
    /// Assigned to one of the instance's processors
    Scheduled,
}

/// Processors whose assignment changed and need a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchPending(pub u32);

impl DispatchPending {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn mark(&mut self, cpu: usize) {
        self.0 |= 1 << cpu;
    }

    pub fn is_marked(&self, cpu: usize) -> bool {
        self.0 & (1 << cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy)]
struct ScheduledEntry {
    slot: u16,
    key: SortKey,
}

/// One scheduler instance: ready structure + Scheduled set + node states.
pub struct SchedulerState {
    ready: ReadyStructure,
    scheduled: [Option<ScheduledEntry>; MAX_CPUS],
    /// First global processor owned by this instance
    cpu_first: usize,
    /// Number of processors owned by this instance
    cpu_count: usize,
    attached: [bool; MAX_THREADS],
    node_state: [NodeState; MAX_THREADS],
    node_key: [SortKey; MAX_THREADS],
}

impl SchedulerState {
    pub fn new(policy: SchedPolicy, cpu_first: usize, cpu_count: usize) -> Self {
        let ready = match policy {
            SchedPolicy::PriorityBitmap => ReadyStructure::Bitmap(BitmapQueue::new()),
            SchedPolicy::Edf => ReadyStructure::Edf(EdfQueue::new()),
        };
        Self {
            ready,
            scheduled: [None; MAX_CPUS],
            cpu_first,
            cpu_count,
            attached: [false; MAX_THREADS],
            node_state: [NodeState::NotScheduled; MAX_THREADS],
            node_key: [0; MAX_THREADS],
        }
    }

    fn global_cpu(&self, pos: usize) -> usize {
        self.cpu_first + pos
    }

    fn check_attached(&self, slot: usize) {
        if !self.attached[slot] {
            fatal(FatalCode::UnknownSchedulerNode);
        }
    }

    // ========================================================================
    // Node lifecycle
    // ========================================================================

    /// Register a thread with this instance (at thread creation).
    pub fn attach(&mut self, slot: usize, key: SortKey) {
        if self.attached[slot] {
            fatal(FatalCode::StateCorruption);
        }
        self.attached[slot] = true;
        self.node_state[slot] = NodeState::NotScheduled;
        self.node_key[slot] = key;
    }

    /// Remove a thread's node entirely (thread deletion).
    pub fn detach(&mut self, slot: usize, pending: &mut DispatchPending) {
        self.check_attached(slot);
        self.withdraw(slot, pending);
        self.attached[slot] = false;
    }

    /// Force the node out of both sets, backfilling a vacated processor.
    pub fn withdraw(&mut self, slot: usize, pending: &mut DispatchPending) {
        match self.node_state[slot] {
            NodeState::NotScheduled => {}
            NodeState::Ready => {
                self.ready.extract(slot);
                self.node_state[slot] = NodeState::NotScheduled;
            }
            NodeState::Scheduled => {
                let pos = self.position_of(slot).expect("scheduled node has a seat");
                self.scheduled[pos] = None;
                self.node_state[slot] = NodeState::NotScheduled;
                let _ = self.move_ready_to_scheduled(pos);
                pending.mark(self.global_cpu(pos));
            }
        }
    }

    // ========================================================================
    // Eligibility events
    // ========================================================================

    /// A thread became eligible to run.
    pub fn unblock(&mut self, slot: usize, pending: &mut DispatchPending) {
        self.check_attached(slot);
        if self.node_state[slot] != NodeState::NotScheduled {
            fatal(FatalCode::StateCorruption);
        }
        let key = self.node_key[slot];

        if let Some(pos) = self.free_position() {
            self.seat(pos, slot, key);
            pending.mark(self.global_cpu(pos));
            return;
        }

        match self.lowest_scheduled() {
            Some((pos, worst)) if key < worst => {
                // Preempt: incumbent returns to ready without losing its
                // place among equals
                self.move_scheduled_to_ready(pos);
                self.seat(pos, slot, key);
                pending.mark(self.global_cpu(pos));
            }
            _ => {
                self.ready.enqueue(slot, key);
                self.node_state[slot] = NodeState::Ready;
            }
        }
    }

    /// A thread ceased to be eligible (blocked).
    pub fn block(&mut self, slot: usize, pending: &mut DispatchPending) {
        self.check_attached(slot);
        match self.node_state[slot] {
            NodeState::Scheduled => {
                let pos = self.position_of(slot).expect("scheduled node has a seat");
                self.scheduled[pos] = None;
                self.node_state[slot] = NodeState::NotScheduled;
                let _ = self.move_ready_to_scheduled(pos);
                pending.mark(self.global_cpu(pos));
            }
            NodeState::Ready => {
                self.ready.extract(slot);
                self.node_state[slot] = NodeState::NotScheduled;
            }
            NodeState::NotScheduled => fatal(FatalCode::StateCorruption),
        }
    }

    /// Voluntary yield: rotate behind same-key peers.
    pub fn yield_now(&mut self, slot: usize, pending: &mut DispatchPending) {
        self.check_attached(slot);
        let key = self.node_key[slot];
        match self.node_state[slot] {
            NodeState::Scheduled => {
                let pos = self.position_of(slot).expect("scheduled node has a seat");
                self.scheduled[pos] = None;
                self.node_state[slot] = NodeState::NotScheduled;
                self.ready.enqueue(slot, key);
                self.node_state[slot] = NodeState::Ready;
                let picked = self.move_ready_to_scheduled(pos);
                if picked != Some(slot) {
                    pending.mark(self.global_cpu(pos));
                }
            }
            NodeState::Ready => {
                self.ready.extract(slot);
                self.ready.enqueue(slot, key);
            }
            NodeState::NotScheduled => {}
        }
    }

    /// Re-key a node after a priority/deadline change, repositioning it and
    /// re-deciding domination.
    pub fn update_key(&mut self, slot: usize, new_key: SortKey, pending: &mut DispatchPending) {
        self.check_attached(slot);
        self.node_key[slot] = new_key;
        match self.node_state[slot] {
            NodeState::NotScheduled => {}
            NodeState::Ready => {
                self.ready.extract(slot);
                self.ready.enqueue(slot, new_key);
                // The reposition may now dominate a Scheduled thread
                if let Some((pos, worst)) = self.lowest_scheduled() {
                    if new_key < worst {
                        self.ready.extract(slot);
                        self.node_state[slot] = NodeState::NotScheduled;
                        self.move_scheduled_to_ready(pos);
                        self.seat(pos, slot, new_key);
                        pending.mark(self.global_cpu(pos));
                    }
                }
            }
            NodeState::Scheduled => {
                let pos = self.position_of(slot).expect("scheduled node has a seat");
                self.scheduled[pos] = Some(ScheduledEntry {
                    slot: slot as u16,
                    key: new_key,
                });
                // A worsened key may surrender the processor to a ready
                // thread
                if let Some(head) = self.ready.highest_ready() {
                    if self.node_key[head] < new_key {
                        self.scheduled[pos] = None;
                        self.node_state[slot] = NodeState::NotScheduled;
                        self.ready.enqueue_first(slot, new_key);
                        self.node_state[slot] = NodeState::Ready;
                        let _ = self.move_ready_to_scheduled(pos);
                        pending.mark(self.global_cpu(pos));
                    }
                }
            }
        }
    }

    // ========================================================================
    // Scheduled-set plumbing
    // ========================================================================

    fn seat(&mut self, pos: usize, slot: usize, key: SortKey) {
        self.scheduled[pos] = Some(ScheduledEntry {
            slot: slot as u16,
            key,
        });
        self.node_state[slot] = NodeState::Scheduled;
    }

    fn free_position(&self) -> Option<usize> {
        (0..self.cpu_count).find(|&pos| self.scheduled[pos].is_none())
    }

    /// The seat whose occupant is least urgent (numerically greatest key).
    fn lowest_scheduled(&self) -> Option<(usize, SortKey)> {
        let mut worst: Option<(usize, SortKey)> = None;
        for pos in 0..self.cpu_count {
            if let Some(entry) = self.scheduled[pos] {
                match worst {
                    Some((_, key)) if entry.key <= key => {}
                    _ => worst = Some((pos, entry.key)),
                }
            }
        }
        worst
    }

    fn position_of(&self, slot: usize) -> Option<usize> {
        (0..self.cpu_count).find(|&pos| {
            self.scheduled[pos].map(|e| e.slot as usize) == Some(slot)
        })
    }

    /// Pull the most urgent ready thread onto the seat at `pos`.
    fn move_ready_to_scheduled(&mut self, pos: usize) -> Option<usize> {
        let head = self.ready.highest_ready()?;
        self.ready.extract(head);
        let key = self.node_key[head];
        self.seat(pos, head, key);
        Some(head)
    }

    /// Displace the occupant of `pos` back into the ready structure,
    /// preserving its position among equals.
    fn move_scheduled_to_ready(&mut self, pos: usize) {
        let entry = self.scheduled[pos].take().expect("occupied seat");
        let slot = entry.slot as usize;
        self.ready.enqueue_first(slot, entry.key);
        self.node_state[slot] = NodeState::Ready;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn node_state(&self, slot: usize) -> NodeState {
        self.node_state[slot]
    }

    pub fn node_key(&self, slot: usize) -> SortKey {
        self.node_key[slot]
    }

    pub fn is_scheduled(&self, slot: usize) -> bool {
        self.node_state[slot] == NodeState::Scheduled
    }

    /// Occupants of this instance's seats, by instance-local position.
    pub fn scheduled_slots(&self) -> [Option<usize>; MAX_CPUS] {
        let mut out = [None; MAX_CPUS];
        for pos in 0..self.cpu_count {
            out[pos] = self.scheduled[pos].map(|e| e.slot as usize);
        }
        out
    }

    /// Head of the ready structure (most urgent thread without a seat).
    pub fn highest_ready(&self) -> Option<usize> {
        self.ready.highest_ready()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn uniproc() -> SchedulerState {
        SchedulerState::new(SchedPolicy::PriorityBitmap, 0, 1)
    }

    fn smp2() -> SchedulerState {
        SchedulerState::new(SchedPolicy::PriorityBitmap, 0, 2)
    }

    #[test]
    fn test_unblock_takes_free_seat() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.unblock(1, &mut pending);
        assert_eq!(s.node_state(1), NodeState::Scheduled);
        assert!(pending.is_marked(0));
    }

    #[test]
    fn test_strictly_better_key_preempts() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 5);
        s.unblock(1, &mut pending);

        let mut pending = DispatchPending::new();
        s.unblock(2, &mut pending);
        assert_eq!(s.node_state(2), NodeState::Scheduled);
        assert_eq!(s.node_state(1), NodeState::Ready);
        assert!(pending.is_marked(0));
    }

    #[test]
    fn test_equal_key_does_not_preempt() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 10);
        s.unblock(1, &mut pending);

        let mut pending = DispatchPending::new();
        s.unblock(2, &mut pending);
        assert_eq!(s.node_state(1), NodeState::Scheduled);
        assert_eq!(s.node_state(2), NodeState::Ready);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_block_backfills_from_ready() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 5);
        s.attach(2, 10);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);
        assert_eq!(s.node_state(2), NodeState::Ready);

        let mut pending = DispatchPending::new();
        s.block(1, &mut pending);
        assert_eq!(s.node_state(1), NodeState::NotScheduled);
        assert_eq!(s.node_state(2), NodeState::Scheduled);
        assert!(pending.is_marked(0));
    }

    #[test]
    fn test_displaced_incumbent_keeps_position() {
        // Two equal-priority ready threads behind the incumbent; when the
        // incumbent is displaced by a better arrival and the better thread
        // leaves again, the incumbent - not its peers - gets the seat back.
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 10);
        s.attach(3, 10);
        s.attach(4, 5);
        s.unblock(1, &mut pending); // seated
        s.unblock(2, &mut pending); // ready, behind
        s.unblock(3, &mut pending); // ready, last

        s.unblock(4, &mut pending); // preempts thread 1
        assert_eq!(s.node_state(4), NodeState::Scheduled);

        s.block(4, &mut pending); // better thread leaves
        assert_eq!(s.node_state(1), NodeState::Scheduled);
    }

    #[test]
    fn test_smp_fills_all_seats() {
        let mut s = smp2();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 20);
        s.attach(3, 5);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);
        assert!(s.is_scheduled(1));
        assert!(s.is_scheduled(2));

        // Third thread preempts the worst seat (thread 2, key 20)
        let mut pending = DispatchPending::new();
        s.unblock(3, &mut pending);
        assert!(s.is_scheduled(1));
        assert!(s.is_scheduled(3));
        assert_eq!(s.node_state(2), NodeState::Ready);
        assert!(pending.is_marked(1));
    }

    #[test]
    fn test_yield_rotates_among_equals() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 10);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);

        let mut pending = DispatchPending::new();
        s.yield_now(1, &mut pending);
        assert_eq!(s.node_state(2), NodeState::Scheduled);
        assert_eq!(s.node_state(1), NodeState::Ready);
        assert!(pending.is_marked(0));

        // Yield again: back to thread 1
        let mut pending = DispatchPending::new();
        s.yield_now(2, &mut pending);
        assert_eq!(s.node_state(1), NodeState::Scheduled);
    }

    #[test]
    fn test_yield_alone_keeps_seat() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.unblock(1, &mut pending);

        let mut pending = DispatchPending::new();
        s.yield_now(1, &mut pending);
        assert_eq!(s.node_state(1), NodeState::Scheduled);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_update_key_promotes_ready_thread() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 20);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);
        assert_eq!(s.node_state(2), NodeState::Ready);

        let mut pending = DispatchPending::new();
        s.update_key(2, 3, &mut pending);
        assert_eq!(s.node_state(2), NodeState::Scheduled);
        assert_eq!(s.node_state(1), NodeState::Ready);
        assert!(pending.is_marked(0));
    }

    #[test]
    fn test_update_key_demotes_scheduled_thread() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 20);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);

        let mut pending = DispatchPending::new();
        s.update_key(1, 30, &mut pending);
        assert_eq!(s.node_state(2), NodeState::Scheduled);
        assert_eq!(s.node_state(1), NodeState::Ready);
    }

    #[test]
    fn test_update_key_without_domination_change() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.attach(2, 20);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);

        let mut pending = DispatchPending::new();
        s.update_key(2, 15, &mut pending);
        assert_eq!(s.node_state(1), NodeState::Scheduled);
        assert_eq!(s.node_state(2), NodeState::Ready);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_withdraw_scheduled_backfills() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 5);
        s.attach(2, 10);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);

        let mut pending = DispatchPending::new();
        s.withdraw(1, &mut pending);
        assert_eq!(s.node_state(1), NodeState::NotScheduled);
        assert_eq!(s.node_state(2), NodeState::Scheduled);
    }

    #[test]
    fn test_detach_forgets_node() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.attach(1, 5);
        s.detach(1, &mut pending);
        // Slot can be attached again (thread slot reuse)
        s.attach(1, 7);
        assert_eq!(s.node_key(1), 7);
    }

    #[test]
    #[should_panic(expected = "unknown_scheduler_node")]
    fn test_unattached_slot_is_fatal() {
        let mut s = uniproc();
        let mut pending = DispatchPending::new();
        s.unblock(3, &mut pending);
    }

    #[test]
    fn test_edf_instance_orders_by_deadline() {
        let mut s = SchedulerState::new(SchedPolicy::Edf, 0, 1);
        let mut pending = DispatchPending::new();
        s.attach(1, 5000);
        s.attach(2, 1000);
        s.unblock(1, &mut pending);
        s.unblock(2, &mut pending);
        assert!(s.is_scheduled(2));
        assert_eq!(s.node_state(1), NodeState::Ready);
    }

    #[test]
    fn test_dispatch_pending_global_cpu_offset() {
        let mut s = SchedulerState::new(SchedPolicy::PriorityBitmap, 2, 2);
        let mut pending = DispatchPending::new();
        s.attach(1, 10);
        s.unblock(1, &mut pending);
        assert!(pending.is_marked(2));
        assert!(!pending.is_marked(0));
    }
}
