//! Per-Processor Context
//!
//! One [`PerCpu`] per processor, owned by the core and threaded through
//! every entry point - there is no processor-local static. Each context
//! carries the processor's tick counter, its dispatch-needed flag, and one
//! locked watchdog set per clock class.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::lock::{lock_class, TicketLock};
use crate::watchdog::{WatchdogSet, WATCHDOG_CLASSES};

/// Per-processor state.
pub struct PerCpu {
    pub cpu_id: usize,
    /// Clock interrupts seen by this processor
    tick_count: AtomicU64,
    /// A scheduling decision changed this processor's assignment; the
    /// dispatcher (out of scope) must run a context switch
    dispatch_needed: AtomicBool,
    /// One timeout set per clock class, individually locked so the firing
    /// protocol can drop the lock around each action
    pub(crate) watchdogs: [TicketLock<WatchdogSet>; WATCHDOG_CLASSES],
}

impl PerCpu {
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            tick_count: AtomicU64::new(0),
            dispatch_needed: AtomicBool::new(false),
            watchdogs: [
                TicketLock::new(lock_class::WATCHDOG, WatchdogSet::new()),
                TicketLock::new(lock_class::WATCHDOG, WatchdogSet::new()),
                TicketLock::new(lock_class::WATCHDOG, WatchdogSet::new()),
            ],
        }
    }

    /// Advance the tick counter, returning the new value.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_dispatch_needed(&self) {
        self.dispatch_needed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn dispatch_needed(&self) -> bool {
        self.dispatch_needed.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    #[inline]
    pub fn take_dispatch(&self) -> bool {
        self.dispatch_needed.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counter() {
        let cpu = PerCpu::new(0);
        assert_eq!(cpu.ticks(), 0);
        assert_eq!(cpu.tick(), 1);
        assert_eq!(cpu.tick(), 2);
        assert_eq!(cpu.ticks(), 2);
    }

    #[test]
    fn test_dispatch_flag() {
        let cpu = PerCpu::new(1);
        assert!(!cpu.dispatch_needed());
        cpu.set_dispatch_needed();
        assert!(cpu.dispatch_needed());
        assert!(cpu.take_dispatch());
        assert!(!cpu.dispatch_needed());
        assert!(!cpu.take_dispatch());
    }
}
