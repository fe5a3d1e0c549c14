//! Core Error Types
//!
//! Two kinds of failure, kept strictly apart:
//!
//! - [`CoreError`]: recoverable, caller-visible errors returned by the
//!   external interface. Discriminants are errno values so `to_errno()` is
//!   a trivial cast.
//! - [`FatalCode`]: structural invariant violations and pool exhaustion.
//!   These cannot be unwound mid-protocol and escalate through [`fatal`],
//!   which logs and panics; a kernel build routes the panic handler to the
//!   platform reset path.
//!
//! Expected blocking outcomes (timeout, object deleted while waiting) are
//! not errors at all - they are [`crate::thread::WaitResult`] values.

/// Recoverable errors crossing the core's external interface.
///
/// Every variant's discriminant IS the errno value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CoreError {
    /// Thread/queue/mutex/semaphore pool is full (EAGAIN)
    NoSlot = -11,
    /// Stale or never-valid object id (ESRCH)
    InvalidId = -3,
    /// Release by a thread that does not hold the mutex (EPERM)
    NotOwner = -1,
    /// Object still in use (thread holds mutexes, mutex has holder) (EBUSY)
    Busy = -16,
    /// Operation not valid in the object's current state (EINVAL)
    BadState = -22,
}

impl CoreError {
    /// Convert to errno value for an API layer.
    /// Zero-cost: the discriminant IS the errno.
    pub fn to_errno(self) -> i32 {
        self as i32
    }
}

/// Fatal condition codes.
///
/// Raising one of these means a structural invariant was violated by the
/// caller or a statically-sized pool ran dry mid-protocol; neither can be
/// recovered from safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCode {
    /// Thread inserted into a wait list it already occupies
    DoubleEnqueue,
    /// Watchdog node arena exhausted
    WatchdogPoolExhausted,
    /// Thread destroyed while still linked into a queue or watchdog set
    DestroyWhileLinked,
    /// Mutex acquire by its current holder
    MutexRecursion,
    /// Timeout requested in a clock class the configuration left unwired
    ClassUnavailable,
    /// Inheritance list or wait-state bookkeeping is inconsistent
    StateCorruption,
    /// Scheduler asked to operate on a thread its instance never attached
    UnknownSchedulerNode,
}

impl FatalCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            FatalCode::DoubleEnqueue => "double_enqueue",
            FatalCode::WatchdogPoolExhausted => "watchdog_pool_exhausted",
            FatalCode::DestroyWhileLinked => "destroy_while_linked",
            FatalCode::MutexRecursion => "mutex_recursion",
            FatalCode::ClassUnavailable => "clock_class_unavailable",
            FatalCode::StateCorruption => "state_corruption",
            FatalCode::UnknownSchedulerNode => "unknown_scheduler_node",
        }
    }
}

/// Escalate a fatal condition. Logs the code, then panics.
#[cold]
pub fn fatal(code: FatalCode) -> ! {
    crate::kerror!("core", "fatal"; code = code.as_str());
    panic!("fatal core error: {}", code.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(CoreError::NoSlot.to_errno(), -11);
        assert_eq!(CoreError::InvalidId.to_errno(), -3);
        assert_eq!(CoreError::NotOwner.to_errno(), -1);
        assert_eq!(CoreError::Busy.to_errno(), -16);
        assert_eq!(CoreError::BadState.to_errno(), -22);
    }

    #[test]
    fn test_error_size() {
        assert_eq!(core::mem::size_of::<CoreError>(), 4);
    }

    #[test]
    #[should_panic(expected = "fatal core error")]
    fn test_fatal_panics() {
        fatal(FatalCode::DoubleEnqueue);
    }
}
