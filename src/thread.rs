//! Thread Control State Machine
//!
//! Per-thread state for the scheduling core: lifecycle states with validated
//! transitions, the wait-flags word used to resolve the interrupt-vs-block
//! race, priority fields (real plus inherited), and the fixed thread arena.
//!
//! # State Diagram
//!
//! ```text
//!    create()
//!       │
//!       ▼
//!    Dormant ──start()──► Ready ◄────────────────┐
//!       ▲                   │                    │
//!       │                   │ block(reason)      │ unblock
//!       │                   ▼                    │ (satisfied, timeout,
//!    destroy()           Blocked ────────────────┘  object deleted)
//! ```
//!
//! # Key Invariants
//!
//! 1. Only Ready threads can block (the scheduler decides who executes;
//!    whoever is executing is Ready from the lifecycle's point of view)
//! 2. Only Blocked threads can be unblocked
//! 3. A thread is destroyed only when not linked into any wait list or
//!    watchdog set - violating this is fatal
//! 4. A thread blocks on at most one object at a time

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::MAX_THREADS;
use crate::error::{fatal, CoreError, FatalCode};
use crate::inherit::PriorityNode;
use crate::mutex::MutexId;
use crate::semaphore::SemId;
use crate::threadq::QueueId;
use crate::watchdog::WatchdogRef;

/// Thread priority. 0 is the highest, `PRIORITY_COUNT - 1` the lowest.
pub type Priority = u8;

/// Stable thread handle: arena slot plus generation.
///
/// The generation is bumped on every destroy, so handles to deleted threads
/// go stale instead of aliasing their slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub(crate) slot: u16,
    pub(crate) gen: u16,
}

impl ThreadId {
    /// Pack into a single word (diagnostics, logging)
    pub fn raw(self) -> u32 {
        (self.gen as u32) << 16 | self.slot as u32
    }

    pub(crate) fn slot(self) -> usize {
        self.slot as usize
    }
}

/// Terminal outcome of a blocking operation.
///
/// Exactly one of these is recorded per wait; the wait-flags protocol makes
/// the three paths mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The wait condition was satisfied by a releasing operation
    Satisfied,
    /// The armed watchdog fired before satisfaction
    Timeout,
    /// The object being waited on was deleted
    Deleted,
}

// ============================================================================
// Wait Flags
// ============================================================================

/// Wait-state bits. A blocking thread walks INTEND_TO_BLOCK → BLOCKED;
/// any unblocking path (release, timeout, deletion) moves the word to
/// READY_AGAIN exactly once via compare-exchange.
pub const WAIT_STATE_MASK: u32 = 0xff;
/// The thread has begun the blocking operation (enqueue + optional watchdog)
/// but has not yet given up the processor.
pub const WAIT_INTEND_TO_BLOCK: u32 = 0x1;
/// The blocking operation completed; the thread is off the ready structures.
pub const WAIT_BLOCKED: u32 = 0x2;
/// A condition to end the wait occurred.
pub const WAIT_READY_AGAIN: u32 = 0x4;

/// Wait-class bits, kept alongside the state across one wait.
pub const WAIT_CLASS_MASK: u32 = 0xff00;
/// Waiting on a kernel object (mutex, semaphore, thread queue)
pub const WAIT_CLASS_OBJECT: u32 = 0x100;
/// Pure timed sleep, no object
pub const WAIT_CLASS_SLEEP: u32 = 0x200;

/// The per-thread wait-flags word.
///
/// Mutated by the blocking thread and by racing unblockers (other threads,
/// interrupt handlers); all conflicting updates go through [`try_change`]
/// so exactly one unblock path wins.
///
/// [`try_change`]: WaitFlags::try_change
pub struct WaitFlags(AtomicU32);

impl WaitFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Unconditional store. Only the blocking thread itself may use this,
    /// and only when no racing unblock is possible yet.
    #[inline]
    pub fn set(&self, flags: u32) {
        self.0.store(flags, Ordering::Release);
    }

    /// Atomically replace `expected` with `desired`. Returns false if the
    /// word changed under us - some other path won the race.
    #[inline]
    pub fn try_change(&self, expected: u32, desired: u32) -> bool {
        self.0
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.get() & WAIT_STATE_MASK
    }

    #[inline]
    pub fn class(&self) -> u32 {
        self.get() & WAIT_CLASS_MASK
    }
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// What a blocked thread is waiting on.
///
/// This is the non-owning back-reference from the thread to its blocking
/// object; the owning container is always the object's wait list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Mutex(MutexId),
    Semaphore(SemId),
    Queue(QueueId),
    /// Timed sleep with no object
    Sleep,
}

/// Thread lifecycle state.
///
/// Whether a Ready thread currently occupies a processor is the scheduler's
/// bookkeeping ([`crate::scheduler`]), not lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but never started; not eligible to run
    Dormant,
    /// Eligible to run
    Ready,
    /// Waiting on an object or a timer
    Blocked(BlockReason),
}

/// Error returned when an invalid state transition is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl ThreadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ThreadState::Ready)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, ThreadState::Blocked(_))
    }

    pub fn is_dormant(&self) -> bool {
        matches!(self, ThreadState::Dormant)
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            ThreadState::Blocked(reason) => Some(*reason),
            _ => None,
        }
    }

    /// State name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            ThreadState::Dormant => "Dormant",
            ThreadState::Ready => "Ready",
            ThreadState::Blocked(_) => "Blocked",
        }
    }

    fn can_transition_to(&self, to: &ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, to),
            (Dormant, Ready) | (Ready, Blocked(_)) | (Blocked(_), Ready)
        )
    }

    /// Attempt a transition, returns the old state on success.
    ///
    /// This is the only way lifecycle state changes.
    pub fn transition(&mut self, to: ThreadState) -> Result<ThreadState, InvalidTransition> {
        if self.can_transition_to(&to) {
            let old = *self;
            *self = to;
            Ok(old)
        } else {
            Err(InvalidTransition {
                from: self.name(),
                to: to.name(),
            })
        }
    }
}

// ============================================================================
// Thread Control Block
// ============================================================================

/// Per-thread control state.
pub struct Thread {
    pub id: ThreadId,
    pub name: &'static str,
    /// Scheduler instance this thread is attached to
    pub instance: usize,

    state: ThreadState,
    /// Assigned priority
    real_priority: Priority,
    /// Effective priority: min(real, highest inherited contribution)
    current_priority: Priority,

    pub wait_flags: WaitFlags,
    wait_result: Option<WaitResult>,
    /// Armed timeout, if any (canceled on every unblock path)
    pub(crate) timer: Option<WatchdogRef>,

    /// This thread's contribution to a mutex holder's inheritance list.
    /// A thread blocks on at most one mutex, so one node suffices.
    pub(crate) pnode: PriorityNode,
    /// Head of the inheritance list of threads blocked on mutexes this
    /// thread holds (slot index), descending by contributed priority.
    pub(crate) inherit_head: Option<u16>,
    /// Mutexes currently held
    pub(crate) hold_count: u8,
}

impl Thread {
    fn new(id: ThreadId, name: &'static str, priority: Priority, instance: usize) -> Self {
        Self {
            id,
            name,
            instance,
            state: ThreadState::Dormant,
            real_priority: priority,
            current_priority: priority,
            wait_flags: WaitFlags::new(),
            wait_result: None,
            timer: None,
            pnode: PriorityNode::new(),
            inherit_head: None,
            hold_count: 0,
        }
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn real_priority(&self) -> Priority {
        self.real_priority
    }

    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    pub(crate) fn set_real_priority(&mut self, priority: Priority) {
        self.real_priority = priority;
    }

    pub(crate) fn set_current_priority(&mut self, priority: Priority) {
        self.current_priority = priority;
    }

    pub fn wait_result(&self) -> Option<WaitResult> {
        self.wait_result
    }

    pub(crate) fn set_wait_result(&mut self, result: WaitResult) {
        self.wait_result = Some(result);
    }

    pub(crate) fn clear_wait_result(&mut self) {
        self.wait_result = None;
    }

    /// Dormant → Ready
    pub(crate) fn start(&mut self) -> Result<(), InvalidTransition> {
        self.state.transition(ThreadState::Ready).map(|_| ())
    }

    /// Ready → Blocked
    pub(crate) fn block(&mut self, reason: BlockReason) -> Result<(), InvalidTransition> {
        self.state
            .transition(ThreadState::Blocked(reason))
            .map(|_| ())
    }

    /// Blocked → Ready
    pub(crate) fn unblock(&mut self) -> Result<(), InvalidTransition> {
        self.state.transition(ThreadState::Ready).map(|_| ())
    }
}

// ============================================================================
// Thread Arena
// ============================================================================

/// Fixed-capacity thread storage with generation-checked handles.
pub struct ThreadArena {
    slots: [Option<Thread>; MAX_THREADS],
    gens: [u16; MAX_THREADS],
    count: usize,
}

impl ThreadArena {
    pub const fn new() -> Self {
        const EMPTY: Option<Thread> = None;
        Self {
            slots: [EMPTY; MAX_THREADS],
            gens: [0; MAX_THREADS],
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Create a thread in the Dormant state.
    pub fn create(
        &mut self,
        name: &'static str,
        priority: Priority,
        instance: usize,
    ) -> Result<ThreadId, CoreError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(CoreError::NoSlot)?;
        let id = ThreadId {
            slot: slot as u16,
            gen: self.gens[slot],
        };
        self.slots[slot] = Some(Thread::new(id, name, priority, instance));
        self.count += 1;
        crate::kdebug!("thread", "created"; tid = id.raw(), prio = priority as u64);
        Ok(id)
    }

    /// Destroy a thread.
    ///
    /// Fatal if the thread is still linked into a wait list or watchdog set
    /// (callers must extract it first).
    pub fn destroy(&mut self, id: ThreadId) -> Result<(), CoreError> {
        let thread = self.get(id).ok_or(CoreError::InvalidId)?;
        if thread.state.is_blocked() || thread.timer.is_some() || thread.pnode.is_linked() {
            fatal(FatalCode::DestroyWhileLinked);
        }
        let slot = id.slot();
        self.slots[slot] = None;
        self.gens[slot] = self.gens[slot].wrapping_add(1);
        self.count -= 1;
        crate::kdebug!("thread", "destroyed"; tid = id.raw());
        Ok(())
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        let slot = id.slot();
        if slot >= MAX_THREADS || self.gens[slot] != id.gen {
            return None;
        }
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let slot = id.slot();
        if slot >= MAX_THREADS || self.gens[slot] != id.gen {
            return None;
        }
        self.slots[slot].as_mut()
    }

    /// Access by raw slot (internal structures store slots, not full ids).
    pub(crate) fn at(&self, slot: usize) -> Option<&Thread> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub(crate) fn at_mut(&mut self, slot: usize) -> Option<&mut Thread> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = ThreadState::Dormant;
        assert!(state.transition(ThreadState::Ready).is_ok());
        assert!(state
            .transition(ThreadState::Blocked(BlockReason::Sleep))
            .is_ok());
        assert!(state.is_blocked());
        assert!(state.transition(ThreadState::Ready).is_ok());
        assert!(state.is_ready());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = ThreadState::Dormant;
        // Dormant cannot block
        let err = state
            .transition(ThreadState::Blocked(BlockReason::Sleep))
            .unwrap_err();
        assert_eq!(err.from, "Dormant");
        assert_eq!(err.to, "Blocked");

        // Ready cannot go back to Dormant
        let mut state = ThreadState::Ready;
        assert!(state.transition(ThreadState::Dormant).is_err());

        // Blocked cannot block again
        let mut state = ThreadState::Blocked(BlockReason::Sleep);
        assert!(state
            .transition(ThreadState::Blocked(BlockReason::Sleep))
            .is_err());
    }

    #[test]
    fn test_wait_flags_race_resolution() {
        let flags = WaitFlags::new();
        flags.set(WAIT_CLASS_OBJECT | WAIT_INTEND_TO_BLOCK);

        // Racing unblock wins during the intend phase
        assert!(flags.try_change(
            WAIT_CLASS_OBJECT | WAIT_INTEND_TO_BLOCK,
            WAIT_CLASS_OBJECT | WAIT_READY_AGAIN,
        ));

        // The blocking thread's finalize now fails - it must not block
        assert!(!flags.try_change(
            WAIT_CLASS_OBJECT | WAIT_INTEND_TO_BLOCK,
            WAIT_CLASS_OBJECT | WAIT_BLOCKED,
        ));
        assert_eq!(flags.state(), WAIT_READY_AGAIN);
    }

    #[test]
    fn test_wait_flags_single_winner() {
        let flags = WaitFlags::new();
        flags.set(WAIT_CLASS_OBJECT | WAIT_BLOCKED);

        // First unblocker wins
        assert!(flags.try_change(
            WAIT_CLASS_OBJECT | WAIT_BLOCKED,
            WAIT_CLASS_OBJECT | WAIT_READY_AGAIN,
        ));
        // Second one loses
        assert!(!flags.try_change(
            WAIT_CLASS_OBJECT | WAIT_BLOCKED,
            WAIT_CLASS_OBJECT | WAIT_READY_AGAIN,
        ));
    }

    #[test]
    fn test_arena_create_and_lookup() {
        let mut arena = ThreadArena::new();
        let id = arena.create("worker", 10, 0).unwrap();
        let t = arena.get(id).unwrap();
        assert_eq!(t.name, "worker");
        assert_eq!(t.real_priority(), 10);
        assert_eq!(t.current_priority(), 10);
        assert!(t.state().is_dormant());
    }

    #[test]
    fn test_arena_stale_handle() {
        let mut arena = ThreadArena::new();
        let id = arena.create("short", 5, 0).unwrap();
        arena.destroy(id).unwrap();
        assert!(arena.get(id).is_none());

        // Slot reuse gets a fresh generation
        let id2 = arena.create("next", 5, 0).unwrap();
        assert_eq!(id2.slot, id.slot);
        assert_ne!(id2.gen, id.gen);
        assert!(arena.get(id).is_none());
        assert!(arena.get(id2).is_some());
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut arena = ThreadArena::new();
        for _ in 0..MAX_THREADS {
            arena.create("filler", 1, 0).unwrap();
        }
        assert_eq!(arena.create("extra", 1, 0), Err(CoreError::NoSlot));
    }

    #[test]
    #[should_panic(expected = "destroy_while_linked")]
    fn test_destroy_blocked_thread_is_fatal() {
        let mut arena = ThreadArena::new();
        let id = arena.create("victim", 1, 0).unwrap();
        let t = arena.get_mut(id).unwrap();
        t.start().unwrap();
        t.block(BlockReason::Sleep).unwrap();
        let _ = arena.destroy(id);
    }

    #[test]
    fn test_arena_iter_skips_free_slots() {
        let mut arena = ThreadArena::new();
        let a = arena.create("a", 1, 0).unwrap();
        let _b = arena.create("b", 2, 0).unwrap();
        arena.destroy(a).unwrap();
        let names: std::vec::Vec<_> = arena.iter().map(|t| t.name).collect();
        assert_eq!(names, ["b"]);
    }
}
