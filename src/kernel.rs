//! Core Composition
//!
//! [`SchedCore`] ties the pieces together: the thread arena and blocking
//! objects behind the wait lock, one locked scheduler state per instance,
//! and per-processor contexts carrying tick counts, dispatch flags and
//! watchdog sets. The whole core is an explicit value threaded through
//! every entry point; hardware enters only through the [`Cpu`] HAL.
//!
//! # Lock discipline
//!
//! ```text
//! WAIT (thread arena, queues, mutexes, semaphores)
//!   └─► WATCHDOG (arming/canceling a timeout)
//!   └─► SCHED (re-keying or unblocking under the wait lock)
//! ```
//!
//! Expired watchdog actions always run with the watchdog lock released.
//!
//! # Blocking protocol
//!
//! A blocking call walks four phases:
//!
//! 1. Under the wait lock: wait flags to INTEND_TO_BLOCK, clear the old
//!    result, enqueue on the object's wait list, lifecycle to Blocked,
//!    optionally arm a timeout.
//! 2. Apply any inheritance key changes to the scheduler instances.
//! 3. Scheduler block (the thread leaves the ready/scheduled sets).
//! 4. Under the wait lock again: try INTEND_TO_BLOCK → BLOCKED. Failure
//!    means a racing unblock already recorded the outcome and undid the
//!    enqueue; the blocker reverts its scheduler block and proceeds with
//!    the recorded result.
//!
//! Unblockers (release, timeout, deletion) move the flags to READY_AGAIN
//! with a compare-exchange, so exactly one terminal outcome is recorded.
//! An unblocker that wins during the intend phase does *not* touch the
//! scheduler - the blocking thread has not left it yet and will revert
//! itself in phase 4.

use crate::config::{CoreConfig, ConfigError, SchedPolicy, MAX_CPUS, MAX_INSTANCES, MAX_THREADS};
use crate::error::{fatal, CoreError, FatalCode};
use crate::hal::Cpu;
use crate::inherit::{
    dequeue_priority_node, enqueue_priority_node, evaluate_chain, release_inherited,
    PriorityUpdates,
};
use crate::lock::{lock_class, TicketLock};
use crate::mutex::{MutexArena, MutexId};
use crate::percpu::PerCpu;
use crate::ready::SortKey;
use crate::scheduler::{DispatchPending, SchedulerState};
use crate::semaphore::{SemArena, SemId};
use crate::thread::{
    BlockReason, Priority, Thread, ThreadArena, ThreadId, ThreadState, WaitResult,
    WAIT_BLOCKED, WAIT_CLASS_OBJECT, WAIT_CLASS_SLEEP, WAIT_INTEND_TO_BLOCK, WAIT_READY_AGAIN,
};
use crate::threadq::{Discipline, QueueArena, QueueId};
use crate::watchdog::{WatchdogAction, WatchdogClass, WatchdogId, WatchdogRef};

/// Absolute expiration in one clock class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub class: WatchdogClass,
    pub at: u64,
}

impl Deadline {
    pub const fn ticks(at: u64) -> Self {
        Self {
            class: WatchdogClass::Ticks,
            at,
        }
    }
}

/// Outcome of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Resolved without giving up the processor
    Immediate(WaitResult),
    /// The thread is blocked; a dispatch is pending and the outcome is read
    /// via [`SchedCore::wait_result`] once the thread resumes
    Blocked,
}

/// How an unblock attempt landed against the wait-flags word.
enum Finish {
    /// Won during the intend phase; the blocker reverts its own scheduler
    /// block, no scheduler work here
    WasIntend,
    /// Won against a fully blocked thread; caller must scheduler-unblock it
    WasBlocked,
    /// Another path already resolved this wait
    Lost,
}

/// Everything behind the wait lock.
pub struct WaitState {
    pub threads: ThreadArena,
    pub(crate) mutexes: MutexArena,
    pub(crate) semaphores: SemArena,
    pub(crate) queues: QueueArena,
}

impl WaitState {
    fn new() -> Self {
        Self {
            threads: ThreadArena::new(),
            mutexes: MutexArena::new(),
            semaphores: SemArena::new(),
            queues: QueueArena::new(),
        }
    }
}

/// Scheduler key changes collected under the wait lock, applied to the
/// instance locks afterwards. Sized for two full inheritance walks (a
/// release runs one for the old holder and one for the new).
struct KeyApply {
    items: [(usize, usize, SortKey); 2 * MAX_THREADS],
    len: usize,
}

impl KeyApply {
    const fn new() -> Self {
        Self {
            items: [(0, 0, 0); 2 * MAX_THREADS],
            len: 0,
        }
    }

    fn push(&mut self, instance: usize, slot: usize, key: SortKey) {
        self.items[self.len] = (instance, slot, key);
        self.len += 1;
    }

    fn iter(&self) -> impl Iterator<Item = (usize, usize, SortKey)> + '_ {
        self.items[..self.len].iter().copied()
    }
}

/// Threads needing a scheduler unblock once the wait lock is dropped.
struct UnblockList {
    items: [(usize, usize); MAX_THREADS],
    len: usize,
}

impl UnblockList {
    const fn new() -> Self {
        Self {
            items: [(0, 0); MAX_THREADS],
            len: 0,
        }
    }

    fn push(&mut self, instance: usize, slot: usize) {
        self.items[self.len] = (instance, slot);
        self.len += 1;
    }

    fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.items[..self.len].iter().copied()
    }
}

// ============================================================================
// The Core
// ============================================================================

/// The scheduling and synchronization core.
pub struct SchedCore<C: Cpu> {
    cpu: C,
    config: CoreConfig,
    wait: TicketLock<WaitState>,
    instances: [Option<TicketLock<SchedulerState>>; MAX_INSTANCES],
    percpu: [PerCpu; MAX_CPUS],
}

impl<C: Cpu> SchedCore<C> {
    pub fn new(cpu: C, config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut instances: [Option<TicketLock<SchedulerState>>; MAX_INSTANCES] =
            core::array::from_fn(|_| None);
        for (i, inst) in config.instances.iter().enumerate() {
            if let Some(inst) = inst {
                instances[i] = Some(TicketLock::new(
                    lock_class::SCHED,
                    SchedulerState::new(inst.policy, inst.cpu_first, inst.cpu_count),
                ));
            }
        }
        crate::kinfo!("core", "bring_up"; cpus = config.cpu_count, tick_ns = config.tick_period_ns);
        Ok(Self {
            cpu,
            config,
            wait: TicketLock::new(lock_class::WAIT, WaitState::new()),
            instances,
            percpu: core::array::from_fn(PerCpu::new),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn instance_lock(&self, idx: usize) -> &TicketLock<SchedulerState> {
        match self.instances.get(idx).and_then(|i| i.as_ref()) {
            Some(lock) => lock,
            None => fatal(FatalCode::StateCorruption),
        }
    }

    fn instance_policy(&self, idx: usize) -> SchedPolicy {
        match self.config.instances.get(idx).and_then(|i| *i) {
            Some(inst) => inst.policy,
            None => fatal(FatalCode::StateCorruption),
        }
    }

    fn apply_dispatch(&self, pending: DispatchPending) {
        for cpu in 0..self.config.cpu_count {
            if pending.is_marked(cpu) {
                self.percpu[cpu].set_dispatch_needed();
            }
        }
    }

    fn apply_keys(&self, keys: &KeyApply) {
        for (instance, slot, key) in keys.iter() {
            let mut pending = DispatchPending::new();
            self.instance_lock(instance)
                .lock(&self.cpu)
                .update_key(slot, key, &mut pending);
            self.apply_dispatch(pending);
        }
    }

    /// Turn inheritance walk results into scheduler key updates. Only
    /// bitmap instances key by priority; EDF keys are deadlines and do not
    /// move with effective priority.
    fn collect_keys(&self, keys: &mut KeyApply, threads: &ThreadArena, updates: &PriorityUpdates) {
        for (slot, prio) in updates.iter() {
            let Some(t) = threads.at(slot as usize) else {
                continue;
            };
            if self.instance_policy(t.instance) == SchedPolicy::PriorityBitmap {
                keys.push(t.instance, slot as usize, prio as SortKey);
            }
        }
    }

    fn apply_unblocks(&self, unblocks: &UnblockList) {
        for (instance, slot) in unblocks.iter() {
            let mut pending = DispatchPending::new();
            self.instance_lock(instance)
                .lock(&self.cpu)
                .unblock(slot, &mut pending);
            self.apply_dispatch(pending);
        }
    }

    // ========================================================================
    // Thread lifecycle
    // ========================================================================

    /// Create a Dormant thread attached to a scheduler instance.
    pub fn thread_create(
        &self,
        name: &'static str,
        priority: Priority,
        instance: usize,
    ) -> Result<ThreadId, CoreError> {
        if self.config.instances.get(instance).copied().flatten().is_none() {
            return Err(CoreError::BadState);
        }
        let tid = self.wait.lock(&self.cpu).threads.create(name, priority, instance)?;
        let key = match self.instance_policy(instance) {
            SchedPolicy::PriorityBitmap => priority as SortKey,
            // EDF threads are least-urgent until a deadline is assigned
            SchedPolicy::Edf => SortKey::MAX,
        };
        self.instance_lock(instance)
            .lock(&self.cpu)
            .attach(tid.slot(), key);
        Ok(tid)
    }

    /// Dormant → Ready; the thread enters its instance's scheduling.
    pub fn thread_start(&self, tid: ThreadId) -> Result<(), CoreError> {
        let instance = {
            let mut w = self.wait.lock(&self.cpu);
            let t = w.threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            t.start().map_err(|_| CoreError::BadState)?;
            t.instance
        };
        let mut pending = DispatchPending::new();
        self.instance_lock(instance)
            .lock(&self.cpu)
            .unblock(tid.slot(), &mut pending);
        self.apply_dispatch(pending);
        Ok(())
    }

    /// Delete a thread: end any wait it is part of, withdraw it from its
    /// scheduler instance, free the control block.
    pub fn thread_delete(&self, tid: ThreadId) -> Result<(), CoreError> {
        let mut keys = KeyApply::new();
        let instance = {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads,
                mutexes,
                semaphores,
                queues,
            } = &mut *w;
            let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            if t.hold_count > 0 {
                return Err(CoreError::Busy);
            }
            let instance = t.instance;
            if let Some(reason) = t.state().block_reason() {
                self.cancel_timer(t);
                let class = t.wait_flags.class();
                // Mark the wait resolved so a racing satisfier backs off
                let _ = t
                    .wait_flags
                    .try_change(class | WAIT_INTEND_TO_BLOCK, class | WAIT_READY_AGAIN)
                    || t.wait_flags
                        .try_change(class | WAIT_BLOCKED, class | WAIT_READY_AGAIN);
                if t.unblock().is_err() {
                    fatal(FatalCode::StateCorruption);
                }
                let slot = tid.slot();
                match reason {
                    BlockReason::Mutex(m) => {
                        if let Some(mx) = mutexes.get_mut(m) {
                            mx.queue.extract(tid);
                        }
                        dequeue_priority_node(threads, slot);
                        if let Some(holder) = mutexes.get(m).and_then(|mx| mx.holder_slot()) {
                            let updates = evaluate_chain(threads, mutexes, holder as usize);
                            self.collect_keys(&mut keys, threads, &updates);
                        }
                    }
                    BlockReason::Semaphore(s) => {
                        if let Some(sem) = semaphores.get_mut(s) {
                            sem.queue.extract(tid);
                        }
                    }
                    BlockReason::Queue(q) => {
                        if let Some(queue) = queues.get_mut(q) {
                            queue.extract(tid);
                        }
                    }
                    BlockReason::Sleep => {}
                }
            }
            instance
        };
        self.apply_keys(&keys);

        let mut pending = DispatchPending::new();
        self.instance_lock(instance)
            .lock(&self.cpu)
            .detach(tid.slot(), &mut pending);
        self.apply_dispatch(pending);

        self.wait.lock(&self.cpu).threads.destroy(tid)
    }

    /// Change a thread's assigned priority. The effective priority stays
    /// bounded by inherited contributions; changes propagate through
    /// nested mutex ownership and reposition the thread everywhere it is
    /// queued.
    pub fn thread_set_priority(
        &self,
        tid: ThreadId,
        priority: Priority,
    ) -> Result<(), CoreError> {
        let mut keys = KeyApply::new();
        {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads,
                mutexes,
                semaphores,
                queues,
            } = &mut *w;
            let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            let slot = tid.slot();
            t.set_real_priority(priority);
            let updates = evaluate_chain(threads, mutexes, slot);
            self.collect_keys(&mut keys, threads, &updates);

            // Reposition in a non-mutex wait list (mutex queues are handled
            // inside the inheritance walk)
            let t = threads.at(slot).ok_or(CoreError::InvalidId)?;
            let current = t.current_priority();
            match t.state().block_reason() {
                Some(BlockReason::Semaphore(s)) => {
                    if let Some(sem) = semaphores.get_mut(s) {
                        sem.queue.requeue(tid, current);
                    }
                }
                Some(BlockReason::Queue(q)) => {
                    if let Some(queue) = queues.get_mut(q) {
                        queue.requeue(tid, current);
                    }
                }
                _ => {}
            }
        }
        self.apply_keys(&keys);
        Ok(())
    }

    /// Assign an EDF thread's absolute deadline (its sort key).
    pub fn thread_set_deadline(&self, tid: ThreadId, deadline: u64) -> Result<(), CoreError> {
        let instance = {
            let w = self.wait.lock(&self.cpu);
            let t = w.threads.get(tid).ok_or(CoreError::InvalidId)?;
            t.instance
        };
        if self.instance_policy(instance) != SchedPolicy::Edf {
            return Err(CoreError::BadState);
        }
        let mut pending = DispatchPending::new();
        self.instance_lock(instance)
            .lock(&self.cpu)
            .update_key(tid.slot(), deadline, &mut pending);
        self.apply_dispatch(pending);
        Ok(())
    }

    /// Voluntarily rotate behind same-priority peers.
    pub fn thread_yield(&self, tid: ThreadId) -> Result<(), CoreError> {
        let instance = {
            let w = self.wait.lock(&self.cpu);
            w.threads.get(tid).ok_or(CoreError::InvalidId)?.instance
        };
        let mut pending = DispatchPending::new();
        self.instance_lock(instance)
            .lock(&self.cpu)
            .yield_now(tid.slot(), &mut pending);
        self.apply_dispatch(pending);
        Ok(())
    }

    // ========================================================================
    // Wait-flags plumbing
    // ========================================================================

    /// Clock classes the configuration left unwired must never be used.
    fn check_class(&self, class: WatchdogClass) {
        let available = match class {
            WatchdogClass::Ticks => true,
            WatchdogClass::Monotonic => self.config.has_monotonic,
            WatchdogClass::Realtime => self.config.has_realtime,
        };
        if !available {
            fatal(FatalCode::ClassUnavailable);
        }
    }

    fn cancel_timer(&self, t: &mut Thread) {
        if let Some(r) = t.timer.take() {
            self.percpu[r.cpu].watchdogs[r.class.index()]
                .lock(&self.cpu)
                .remove(r.id);
        }
    }

    fn arm_timer(&self, t: &mut Thread, tid: ThreadId, deadline: Deadline) {
        self.check_class(deadline.class);
        let cpu = self.cpu.cpu_id();
        let id = self.percpu[cpu].watchdogs[deadline.class.index()]
            .lock(&self.cpu)
            .insert(deadline.at, WatchdogAction::ThreadTimeout(tid));
        t.timer = Some(WatchdogRef {
            cpu,
            class: deadline.class,
            id,
        });
    }

    /// Resolve a wait with `result`. The caller has already removed the
    /// thread from the object's wait list (or is about to, idempotently).
    fn finish_wait(&self, t: &mut Thread, result: WaitResult) -> Finish {
        let class = t.wait_flags.class();
        let outcome = if t
            .wait_flags
            .try_change(class | WAIT_INTEND_TO_BLOCK, class | WAIT_READY_AGAIN)
        {
            Finish::WasIntend
        } else if t
            .wait_flags
            .try_change(class | WAIT_BLOCKED, class | WAIT_READY_AGAIN)
        {
            Finish::WasBlocked
        } else {
            return Finish::Lost;
        };
        t.set_wait_result(result);
        self.cancel_timer(t);
        if t.unblock().is_err() {
            fatal(FatalCode::StateCorruption);
        }
        outcome
    }

    /// Phases 2-4 of the blocking protocol (see module docs).
    fn commit_block(
        &self,
        tid: ThreadId,
        instance: usize,
        class: u32,
        keys: KeyApply,
    ) -> BlockStatus {
        self.apply_keys(&keys);

        let mut pending = DispatchPending::new();
        self.instance_lock(instance)
            .lock(&self.cpu)
            .block(tid.slot(), &mut pending);
        self.apply_dispatch(pending);

        let raced = {
            let mut w = self.wait.lock(&self.cpu);
            let Some(t) = w.threads.get_mut(tid) else {
                fatal(FatalCode::StateCorruption);
            };
            if t.wait_flags
                .try_change(class | WAIT_INTEND_TO_BLOCK, class | WAIT_BLOCKED)
            {
                None
            } else {
                Some(t.wait_result().unwrap_or(WaitResult::Satisfied))
            }
        };

        match raced {
            None => BlockStatus::Blocked,
            Some(result) => {
                // A racing unblock won during the intend phase and undid the
                // enqueue; revert our scheduler block and carry on
                let mut pending = DispatchPending::new();
                self.instance_lock(instance)
                    .lock(&self.cpu)
                    .unblock(tid.slot(), &mut pending);
                self.apply_dispatch(pending);
                BlockStatus::Immediate(result)
            }
        }
    }

    // ========================================================================
    // Generic thread queues
    // ========================================================================

    pub fn queue_create(&self, discipline: Discipline) -> Result<QueueId, CoreError> {
        self.wait.lock(&self.cpu).queues.create(discipline)
    }

    /// Delete a queue, ending every wait with `Deleted`.
    pub fn queue_delete(&self, qid: QueueId) -> Result<usize, CoreError> {
        let flushed = self.queue_flush(qid)?;
        self.wait.lock(&self.cpu).queues.destroy(qid)?;
        Ok(flushed)
    }

    /// Block `tid` on a queue, optionally with a timeout.
    pub fn thread_block_on(
        &self,
        qid: QueueId,
        tid: ThreadId,
        timeout: Option<Deadline>,
    ) -> Result<BlockStatus, CoreError> {
        let instance = {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads, queues, ..
            } = &mut *w;
            let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            if !t.state().is_ready() {
                return Err(CoreError::BadState);
            }
            let prio = t.current_priority();
            let instance = t.instance;
            let q = queues.get_mut(qid).ok_or(CoreError::InvalidId)?;

            let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            t.wait_flags
                .set(WAIT_CLASS_OBJECT | WAIT_INTEND_TO_BLOCK);
            t.clear_wait_result();
            q.enqueue(tid, prio);
            if t.block(BlockReason::Queue(qid)).is_err() {
                fatal(FatalCode::StateCorruption);
            }
            if let Some(d) = timeout {
                self.arm_timer(t, tid, d);
            }
            instance
        };
        Ok(self.commit_block(tid, instance, WAIT_CLASS_OBJECT, KeyApply::new()))
    }

    /// Hand the queue's next waiter its satisfaction (a releasing
    /// operation picked it per the queue's discipline).
    pub fn queue_surrender(&self, qid: QueueId) -> Result<Option<ThreadId>, CoreError> {
        let mut unblocks = UnblockList::new();
        let next = {
            let mut w = self.wait.lock(&self.cpu);
            let q = w.queues.get_mut(qid).ok_or(CoreError::InvalidId)?;
            let Some(tid) = q.dequeue_first() else {
                return Ok(None);
            };
            let t = w.threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            if let Finish::WasBlocked = self.finish_wait(t, WaitResult::Satisfied) {
                unblocks.push(t.instance, tid.slot());
            }
            Some(tid)
        };
        self.apply_unblocks(&unblocks);
        Ok(next)
    }

    /// Forcibly end every wait on the queue with `Deleted`. Returns how
    /// many waiters were released.
    pub fn queue_flush(&self, qid: QueueId) -> Result<usize, CoreError> {
        let mut unblocks = UnblockList::new();
        let mut count = 0;
        {
            let mut w = self.wait.lock(&self.cpu);
            loop {
                let q = w.queues.get_mut(qid).ok_or(CoreError::InvalidId)?;
                let Some(tid) = q.dequeue_first() else {
                    break;
                };
                let t = w.threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
                if let Finish::WasBlocked = self.finish_wait(t, WaitResult::Deleted) {
                    unblocks.push(t.instance, tid.slot());
                }
                count += 1;
            }
        }
        self.apply_unblocks(&unblocks);
        crate::kdebug!("threadq", "flushed"; qid = qid.raw(), count = count);
        Ok(count)
    }

    // ========================================================================
    // Timed sleep
    // ========================================================================

    /// Block with no object until the deadline passes. Resumes with
    /// `Timeout` - for a sleep that is the expected outcome.
    pub fn thread_sleep(&self, tid: ThreadId, deadline: Deadline) -> Result<BlockStatus, CoreError> {
        let instance = {
            let mut w = self.wait.lock(&self.cpu);
            let t = w.threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            if !t.state().is_ready() {
                return Err(CoreError::BadState);
            }
            t.wait_flags.set(WAIT_CLASS_SLEEP | WAIT_INTEND_TO_BLOCK);
            t.clear_wait_result();
            if t.block(BlockReason::Sleep).is_err() {
                fatal(FatalCode::StateCorruption);
            }
            self.arm_timer(t, tid, deadline);
            t.instance
        };
        Ok(self.commit_block(tid, instance, WAIT_CLASS_SLEEP, KeyApply::new()))
    }

    /// Wake a sleeping thread early (resumes with `Satisfied`).
    pub fn thread_wake(&self, tid: ThreadId) -> Result<bool, CoreError> {
        let mut unblocks = UnblockList::new();
        let woke = {
            let mut w = self.wait.lock(&self.cpu);
            let t = w.threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            if t.state().block_reason() != Some(BlockReason::Sleep) {
                return Ok(false);
            }
            match self.finish_wait(t, WaitResult::Satisfied) {
                Finish::WasBlocked => {
                    unblocks.push(t.instance, tid.slot());
                    true
                }
                Finish::WasIntend => true,
                Finish::Lost => false,
            }
        };
        self.apply_unblocks(&unblocks);
        Ok(woke)
    }

    // ========================================================================
    // Mutexes
    // ========================================================================

    pub fn mutex_create(&self) -> Result<MutexId, CoreError> {
        self.wait.lock(&self.cpu).mutexes.create()
    }

    /// Acquire a mutex, inheriting priority to the holder when blocking.
    pub fn mutex_acquire(
        &self,
        mid: MutexId,
        tid: ThreadId,
        timeout: Option<Deadline>,
    ) -> Result<BlockStatus, CoreError> {
        let mut keys = KeyApply::new();
        let instance = {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads, mutexes, ..
            } = &mut *w;
            let (slot, instance, prio) = {
                let t = threads.get(tid).ok_or(CoreError::InvalidId)?;
                if !t.state().is_ready() {
                    return Err(CoreError::BadState);
                }
                (tid.slot(), t.instance, t.current_priority())
            };
            let m = mutexes.get_mut(mid).ok_or(CoreError::InvalidId)?;
            let holder = match m.holder {
                None => {
                    m.holder = Some(slot as u16);
                    threads
                        .get_mut(tid)
                        .ok_or(CoreError::InvalidId)?
                        .hold_count += 1;
                    return Ok(BlockStatus::Immediate(WaitResult::Satisfied));
                }
                Some(h) if h as usize == slot => fatal(FatalCode::MutexRecursion),
                Some(h) => h as usize,
            };

            m.queue.enqueue(tid, prio);
            {
                let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
                t.wait_flags
                    .set(WAIT_CLASS_OBJECT | WAIT_INTEND_TO_BLOCK);
                t.clear_wait_result();
                if t.block(BlockReason::Mutex(mid)).is_err() {
                    fatal(FatalCode::StateCorruption);
                }
                if let Some(d) = timeout {
                    self.arm_timer(t, tid, d);
                }
            }

            // Contribute our priority to the holder and walk the chain
            enqueue_priority_node(threads, slot, holder, mid, prio);
            let updates = evaluate_chain(threads, mutexes, holder);
            self.collect_keys(&mut keys, threads, &updates);
            instance
        };
        Ok(self.commit_block(tid, instance, WAIT_CLASS_OBJECT, keys))
    }

    /// Release a mutex: drop inherited contributions, hand ownership to the
    /// most urgent waiter, re-root the surviving waiters' contributions on
    /// the new holder.
    pub fn mutex_release(&self, mid: MutexId, tid: ThreadId) -> Result<Option<ThreadId>, CoreError> {
        let mut keys = KeyApply::new();
        let mut unblocks = UnblockList::new();
        let next = {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads, mutexes, ..
            } = &mut *w;
            let slot = tid.slot();
            {
                let m = mutexes.get(mid).ok_or(CoreError::InvalidId)?;
                if m.holder != Some(slot as u16) {
                    crate::kwarn!("mutex", "release_not_owner"; mid = mid.raw(), tid = tid.raw());
                    return Err(CoreError::NotOwner);
                }
            }
            threads.get_mut(tid).ok_or(CoreError::InvalidId)?.hold_count -= 1;

            // The released mutex no longer contributes to us
            release_inherited(threads, slot, mid);
            let updates = evaluate_chain(threads, mutexes, slot);
            self.collect_keys(&mut keys, threads, &updates);

            let next = mutexes
                .get_mut(mid)
                .ok_or(CoreError::InvalidId)?
                .queue
                .dequeue_first();
            match next {
                None => {
                    mutexes.get_mut(mid).ok_or(CoreError::InvalidId)?.holder = None;
                }
                Some(ntid) => {
                    let nslot = ntid.slot();
                    // Surviving waiters contribute to the new holder
                    let mut rest = [0u16; MAX_THREADS];
                    let mut rest_len = 0;
                    {
                        let m = mutexes.get_mut(mid).ok_or(CoreError::InvalidId)?;
                        m.holder = Some(nslot as u16);
                        for wtid in m.queue.iter() {
                            rest[rest_len] = wtid.slot;
                            rest_len += 1;
                        }
                    }
                    for &wslot in &rest[..rest_len] {
                        let prio = match threads.at(wslot as usize) {
                            Some(t) => t.current_priority(),
                            None => fatal(FatalCode::StateCorruption),
                        };
                        enqueue_priority_node(threads, wslot as usize, nslot, mid, prio);
                    }
                    let updates = evaluate_chain(threads, mutexes, nslot);
                    self.collect_keys(&mut keys, threads, &updates);

                    let t = threads.get_mut(ntid).ok_or(CoreError::InvalidId)?;
                    t.hold_count += 1;
                    if let Finish::WasBlocked = self.finish_wait(t, WaitResult::Satisfied) {
                        unblocks.push(t.instance, nslot);
                    }
                }
            }
            next
        };
        self.apply_keys(&keys);
        self.apply_unblocks(&unblocks);
        Ok(next)
    }

    /// Delete a mutex. The holder (if any) loses the inherited boost;
    /// waiters resume with `Deleted`.
    pub fn mutex_delete(&self, mid: MutexId) -> Result<usize, CoreError> {
        let mut keys = KeyApply::new();
        let mut unblocks = UnblockList::new();
        let mut count = 0;
        {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads, mutexes, ..
            } = &mut *w;
            let holder = mutexes.get(mid).ok_or(CoreError::InvalidId)?.holder_slot();
            if let Some(h) = holder {
                release_inherited(threads, h as usize, mid);
                let updates = evaluate_chain(threads, mutexes, h as usize);
                self.collect_keys(&mut keys, threads, &updates);
                match threads.at_mut(h as usize) {
                    Some(t) => t.hold_count -= 1,
                    None => fatal(FatalCode::StateCorruption),
                }
            }
            loop {
                let Some(wtid) = mutexes
                    .get_mut(mid)
                    .ok_or(CoreError::InvalidId)?
                    .queue
                    .dequeue_first()
                else {
                    break;
                };
                dequeue_priority_node(threads, wtid.slot());
                let t = threads.get_mut(wtid).ok_or(CoreError::InvalidId)?;
                if let Finish::WasBlocked = self.finish_wait(t, WaitResult::Deleted) {
                    unblocks.push(t.instance, wtid.slot());
                }
                count += 1;
            }
            mutexes.get_mut(mid).ok_or(CoreError::InvalidId)?.holder = None;
            mutexes.destroy(mid)?;
        }
        self.apply_keys(&keys);
        self.apply_unblocks(&unblocks);
        Ok(count)
    }

    /// A thread's (real, effective) priority pair.
    pub fn thread_priority(&self, tid: ThreadId) -> Option<(Priority, Priority)> {
        let w = self.wait.lock(&self.cpu);
        w.threads
            .get(tid)
            .map(|t| (t.real_priority(), t.current_priority()))
    }

    // ========================================================================
    // Semaphores
    // ========================================================================

    pub fn semaphore_create(
        &self,
        initial: u32,
        discipline: Discipline,
    ) -> Result<SemId, CoreError> {
        self.wait.lock(&self.cpu).semaphores.create(initial, discipline)
    }

    /// Take one unit or block until a release hands one over.
    pub fn semaphore_obtain(
        &self,
        sid: SemId,
        tid: ThreadId,
        timeout: Option<Deadline>,
    ) -> Result<BlockStatus, CoreError> {
        let instance = {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads,
                semaphores,
                ..
            } = &mut *w;
            let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            if !t.state().is_ready() {
                return Err(CoreError::BadState);
            }
            let prio = t.current_priority();
            let instance = t.instance;
            let sem = semaphores.get_mut(sid).ok_or(CoreError::InvalidId)?;
            if sem.count > 0 {
                sem.count -= 1;
                return Ok(BlockStatus::Immediate(WaitResult::Satisfied));
            }
            sem.queue.enqueue(tid, prio);
            let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
            t.wait_flags
                .set(WAIT_CLASS_OBJECT | WAIT_INTEND_TO_BLOCK);
            t.clear_wait_result();
            if t.block(BlockReason::Semaphore(sid)).is_err() {
                fatal(FatalCode::StateCorruption);
            }
            if let Some(d) = timeout {
                self.arm_timer(t, tid, d);
            }
            instance
        };
        Ok(self.commit_block(tid, instance, WAIT_CLASS_OBJECT, KeyApply::new()))
    }

    /// Release one unit: hand it to the next waiter, or bump the count.
    pub fn semaphore_release(&self, sid: SemId) -> Result<Option<ThreadId>, CoreError> {
        let mut unblocks = UnblockList::new();
        let next = {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads,
                semaphores,
                ..
            } = &mut *w;
            let sem = semaphores.get_mut(sid).ok_or(CoreError::InvalidId)?;
            match sem.queue.dequeue_first() {
                None => {
                    sem.count += 1;
                    None
                }
                Some(tid) => {
                    let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
                    if let Finish::WasBlocked = self.finish_wait(t, WaitResult::Satisfied) {
                        unblocks.push(t.instance, tid.slot());
                    }
                    Some(tid)
                }
            }
        };
        self.apply_unblocks(&unblocks);
        Ok(next)
    }

    /// A semaphore's current count.
    pub fn semaphore_count(&self, sid: SemId) -> Option<u32> {
        self.wait.lock(&self.cpu).semaphores.get(sid).map(|s| s.count())
    }

    /// Delete a semaphore; waiters resume with `Deleted`.
    pub fn semaphore_delete(&self, sid: SemId) -> Result<usize, CoreError> {
        let mut unblocks = UnblockList::new();
        let mut count = 0;
        {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads,
                semaphores,
                ..
            } = &mut *w;
            loop {
                let Some(tid) = semaphores
                    .get_mut(sid)
                    .ok_or(CoreError::InvalidId)?
                    .queue
                    .dequeue_first()
                else {
                    break;
                };
                let t = threads.get_mut(tid).ok_or(CoreError::InvalidId)?;
                if let Finish::WasBlocked = self.finish_wait(t, WaitResult::Deleted) {
                    unblocks.push(t.instance, tid.slot());
                }
                count += 1;
            }
            semaphores.destroy(sid)?;
        }
        self.apply_unblocks(&unblocks);
        Ok(count)
    }

    // ========================================================================
    // Clock and watchdogs
    // ========================================================================

    /// Clock interrupt on the local processor: advance the tick count and
    /// fire due tick-class watchdogs.
    pub fn clock_tick(&self) {
        let cpu = self.cpu.cpu_id();
        let now = self.percpu[cpu].tick();
        self.run_expirations(cpu, WatchdogClass::Ticks, now);
    }

    /// Advance a nanosecond clock class on the local processor.
    pub fn advance_clock(&self, class: WatchdogClass, now: u64) {
        self.check_class(class);
        self.run_expirations(self.cpu.cpu_id(), class, now);
    }

    /// Fire every due node in the given set, one at a time, invoking each
    /// action with the set's lock released (actions may arm or cancel
    /// watchdogs themselves - this ordering is load-bearing).
    fn run_expirations(&self, cpu: usize, class: WatchdogClass, now: u64) {
        loop {
            let popped = {
                let mut set = self.percpu[cpu].watchdogs[class.index()].lock(&self.cpu);
                set.pop_expired(now)
            };
            let Some((id, action)) = popped else {
                break;
            };
            match action {
                WatchdogAction::ThreadTimeout(tid) => self.thread_timeout(tid),
                WatchdogAction::Callback(f) => f(id, now),
            }
        }
    }

    /// A timed wait ran out. Exactly one of timeout/satisfaction/deletion
    /// wins via the wait flags; a stale fire is a no-op.
    fn thread_timeout(&self, tid: ThreadId) {
        let mut keys = KeyApply::new();
        let mut unblocks = UnblockList::new();
        {
            let mut w = self.wait.lock(&self.cpu);
            let WaitState {
                threads,
                mutexes,
                semaphores,
                queues,
            } = &mut *w;
            let Some(t) = threads.get_mut(tid) else {
                return;
            };
            let reason = t.state().block_reason();
            match self.finish_wait(t, WaitResult::Timeout) {
                Finish::Lost => return,
                Finish::WasBlocked => unblocks.push(t.instance, tid.slot()),
                Finish::WasIntend => {}
            }
            crate::kdebug!("thread", "wait_timeout"; tid = tid.raw());
            match reason {
                Some(BlockReason::Mutex(m)) => {
                    if let Some(mx) = mutexes.get_mut(m) {
                        mx.queue.extract(tid);
                    }
                    dequeue_priority_node(threads, tid.slot());
                    if let Some(holder) = mutexes.get(m).and_then(|mx| mx.holder_slot()) {
                        let updates = evaluate_chain(threads, mutexes, holder as usize);
                        self.collect_keys(&mut keys, threads, &updates);
                    }
                }
                Some(BlockReason::Semaphore(s)) => {
                    if let Some(sem) = semaphores.get_mut(s) {
                        sem.queue.extract(tid);
                    }
                }
                Some(BlockReason::Queue(q)) => {
                    if let Some(queue) = queues.get_mut(q) {
                        queue.extract(tid);
                    }
                }
                Some(BlockReason::Sleep) | None => {}
            }
        }
        self.apply_keys(&keys);
        self.apply_unblocks(&unblocks);
    }

    /// Arm a general-purpose watchdog on the local processor.
    pub fn watchdog_arm(
        &self,
        class: WatchdogClass,
        expiration: u64,
        callback: fn(WatchdogId, u64),
    ) -> WatchdogRef {
        self.check_class(class);
        let cpu = self.cpu.cpu_id();
        let id = self.percpu[cpu].watchdogs[class.index()]
            .lock(&self.cpu)
            .insert(expiration, WatchdogAction::Callback(callback));
        WatchdogRef { cpu, class, id }
    }

    /// Cancel an armed watchdog. Idempotent.
    pub fn watchdog_cancel(&self, r: WatchdogRef) -> bool {
        self.percpu[r.cpu].watchdogs[r.class.index()]
            .lock(&self.cpu)
            .remove(r.id)
    }

    /// Next expiration in a class on the local processor (for tickless
    /// timer reprogramming).
    pub fn next_deadline(&self, class: WatchdogClass) -> Option<u64> {
        let cpu = self.cpu.cpu_id();
        self.percpu[cpu].watchdogs[class.index()]
            .lock(&self.cpu)
            .next_deadline()
    }

    /// This processor's tick count.
    pub fn ticks(&self) -> u64 {
        self.percpu[self.cpu.cpu_id()].ticks()
    }

    // ========================================================================
    // Dispatch flags and queries
    // ========================================================================

    pub fn dispatch_needed(&self, cpu: usize) -> bool {
        self.percpu[cpu].dispatch_needed()
    }

    /// Clear a processor's dispatch flag, returning whether it was set.
    /// The out-of-scope dispatcher calls this before context switching.
    pub fn take_dispatch(&self, cpu: usize) -> bool {
        self.percpu[cpu].take_dispatch()
    }

    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.wait.lock(&self.cpu).threads.get(tid).map(|t| *t.state())
    }

    pub fn wait_result(&self, tid: ThreadId) -> Option<WaitResult> {
        self.wait.lock(&self.cpu).threads.get(tid).and_then(|t| t.wait_result())
    }

    /// Occupants of an instance's processors, by instance-local position.
    pub fn scheduled_ids(&self, instance: usize) -> [Option<ThreadId>; MAX_CPUS] {
        let w = self.wait.lock(&self.cpu);
        let s = self.instance_lock(instance).lock(&self.cpu);
        let slots = s.scheduled_slots();
        let mut out = [None; MAX_CPUS];
        for (i, slot) in slots.iter().enumerate() {
            out[i] = slot.and_then(|slot| w.threads.at(slot)).map(|t| t.id);
        }
        out
    }

    /// Most urgent thread of an instance still waiting for a processor.
    pub fn highest_ready(&self, instance: usize) -> Option<ThreadId> {
        let w = self.wait.lock(&self.cpu);
        let s = self.instance_lock(instance).lock(&self.cpu);
        s.highest_ready().and_then(|slot| w.threads.at(slot)).map(|t| t.id)
    }
}

// ============================================================================
// Tests
// ============================================================================
