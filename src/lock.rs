//! Locking Primitives
//!
//! FIFO-fair ticket locks for the core's shared structures.
//!
//! ## Design
//!
//! All data locks in this module:
//! - Disable IRQs on acquisition via the [`Cpu`] HAL (irqsave pattern)
//! - Restore IRQ state on drop
//! - Are SMP-safe and grant access in strict ticket (FIFO) order
//!
//! ## Usage
//!
//! ```ignore
//! let state = TicketLock::new(lock_class::WAIT, WaitState::new());
//!
//! fn mutate(cpu: &impl Cpu, state: &TicketLock<WaitState>) {
//!     let mut guard = state.lock(cpu);
//!     guard.field = value;
//! } // IRQs restored, lock released on drop
//! ```

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal::Cpu;

// ============================================================================
// Lock Ordering Classes
// ============================================================================

/// Lock ordering classes for deadlock prevention.
///
/// Locks must be acquired in strictly increasing class order.
/// Gaps between values allow inserting new classes without renumbering.
///
/// ## Ordering (outermost → innermost)
///
/// ```text
/// WAIT(10) → WATCHDOG(20) → SCHED(30)
/// ```
///
/// The wait lock may nest a watchdog set lock (arming a timeout) or a
/// scheduler instance lock (unblocking a waiter). Watchdog and scheduler
/// locks are never held together: expired-timer actions run with the
/// watchdog lock released.
pub mod lock_class {
    /// Skip ordering conventions (test locks, one-off locks)
    pub const UNORDERED: u8 = 0;
    /// Thread arena, thread queues, mutexes, semaphores - acquired first
    pub const WAIT: u8 = 10;
    /// Per-CPU watchdog sets
    pub const WATCHDOG: u8 = 20;
    /// Scheduler instance state (ready + scheduled sets)
    pub const SCHED: u8 = 30;
}

// ============================================================================
// Raw Ticket Lock
// ============================================================================

/// The bare two-counter ticket lock.
///
/// Each acquirer takes a ticket and spins until `now_serving` reaches it,
/// which grants access in strict FIFO order with wait time bounded by the
/// number of contending processors. No blocking, no recursion; holding the
/// lock across an operation that needs it again is a programming error.
pub struct RawTicketLock {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
}

impl RawTicketLock {
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
        }
    }

    /// Acquire the lock, returning the ticket that was served.
    #[inline]
    pub fn acquire(&self) -> u32 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        ticket
    }

    /// Try to acquire without spinning.
    ///
    /// Only succeeds when nobody holds the lock and nobody is waiting.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let current = self.now_serving.load(Ordering::Relaxed);
        self.next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Release the lock - advance `now_serving` to the next ticket.
    #[inline]
    pub fn release(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    /// Check if the lock is currently held.
    ///
    /// Note: racy - the lock may be acquired/released between the check
    /// and any action taken based on it.
    #[inline]
    pub fn is_locked(&self) -> bool {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.now_serving.load(Ordering::Relaxed);
        next != serving
    }
}

// ============================================================================
// Data-Carrying Ticket Lock
// ============================================================================

/// A ticket lock protecting data with IRQ-safe semantics.
///
/// When locked:
/// 1. IRQs are disabled via the `Cpu` HAL (prevents deadlock against
///    interrupt handlers on the local processor)
/// 2. The ticket lock is acquired (for SMP safety)
///
/// When the guard is dropped:
/// 1. The ticket lock is released
/// 2. IRQ state is restored
///
/// # Safety
///
/// Safe to use from both thread and interrupt context, but code holding the
/// lock MUST NOT block or yield.
pub struct TicketLock<T> {
    raw: RawTicketLock,
    data: UnsafeCell<T>,
    /// Lock ordering class (documentation + diagnostics, see `lock_class`)
    class: u8,
    #[cfg(debug_assertions)]
    owner_cpu: AtomicU32,
}

// SAFETY: TicketLock<T> serializes all access to T
unsafe impl<T: Send> Sync for TicketLock<T> {}
unsafe impl<T: Send> Send for TicketLock<T> {}

#[cfg(debug_assertions)]
const NO_OWNER: u32 = u32::MAX;

impl<T> TicketLock<T> {
    /// Create a new lock protecting `data`.
    ///
    /// `class` is the lock ordering class (see [`lock_class`]).
    pub const fn new(class: u8, data: T) -> Self {
        Self {
            raw: RawTicketLock::new(),
            data: UnsafeCell::new(data),
            class,
            #[cfg(debug_assertions)]
            owner_cpu: AtomicU32::new(NO_OWNER),
        }
    }

    /// The lock's ordering class.
    pub fn class(&self) -> u8 {
        self.class
    }

    /// Acquire the lock, disabling IRQs first.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the calling CPU already holds this lock.
    #[inline]
    pub fn lock<'a, C: Cpu + ?Sized>(&'a self, cpu: &'a C) -> TicketGuard<'a, T, C> {
        let irqs_were_enabled = cpu.disable_irq();

        #[cfg(debug_assertions)]
        {
            let me = cpu.cpu_id() as u32;
            if self.owner_cpu.load(Ordering::Relaxed) == me {
                panic!(
                    "ticket lock deadlock: CPU {} already holds class {} lock",
                    me, self.class
                );
            }
        }

        self.raw.acquire();

        #[cfg(debug_assertions)]
        self.owner_cpu.store(cpu.cpu_id() as u32, Ordering::Relaxed);

        TicketGuard {
            lock: self,
            cpu,
            irqs_were_enabled,
        }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock<'a, C: Cpu + ?Sized>(&'a self, cpu: &'a C) -> Option<TicketGuard<'a, T, C>> {
        let irqs_were_enabled = cpu.disable_irq();

        if !self.raw.try_acquire() {
            cpu.restore_irq(irqs_were_enabled);
            return None;
        }

        #[cfg(debug_assertions)]
        self.owner_cpu.store(cpu.cpu_id() as u32, Ordering::Relaxed);

        Some(TicketGuard {
            lock: self,
            cpu,
            irqs_were_enabled,
        })
    }

    /// Check if the lock is currently held (racy, diagnostics only).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Get a mutable reference without locking.
    ///
    /// Statically exclusive, so no synchronization is needed.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Guard that releases a [`TicketLock`] when dropped.
pub struct TicketGuard<'a, T, C: Cpu + ?Sized> {
    lock: &'a TicketLock<T>,
    cpu: &'a C,
    irqs_were_enabled: bool,
}

impl<T, C: Cpu + ?Sized> Deref for TicketGuard<'_, T, C> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: guard existence proves we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, C: Cpu + ?Sized> DerefMut for TicketGuard<'_, T, C> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: guard existence proves we hold the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, C: Cpu + ?Sized> Drop for TicketGuard<'_, T, C> {
    #[inline]
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.owner_cpu.store(NO_OWNER, Ordering::Relaxed);

        self.lock.raw.release();
        self.cpu.restore_irq(self.irqs_were_enabled);
    }
}

// ============================================================================
// Tests
// ============================================================================
