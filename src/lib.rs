//! weft - Real-Time Scheduling and Synchronization Core
//!
//! The part of a real-time kernel that decides which thread runs on which
//! processor, blocks and unblocks threads with bounded-latency structures,
//! and implements priority-inheriting mutual exclusion. Everything above it
//! (API layers, drivers, context switching) and below it (timer hardware,
//! interrupt controllers) is out of scope and reached through narrow seams:
//! the [`hal::Cpu`] trait coming in, dispatch flags and watchdog deadlines
//! going out.
//!
//! ## Layout
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`kernel`] | [`kernel::SchedCore`] - composition and external surface |
//! | [`scheduler`] | per-instance ready/scheduled sets (SMP) |
//! | [`ready`] | priority bitmap + EDF ready structures |
//! | [`thread`] | thread control blocks, lifecycle, wait flags |
//! | [`threadq`] | ordered wait lists for blocking objects |
//! | [`inherit`] | priority inheritance engine |
//! | [`mutex`], [`semaphore`] | core blocking objects |
//! | [`watchdog`] | per-processor timeout sets |
//! | [`lock`] | FIFO-fair ticket locks |
//! | [`percpu`] | per-processor context |
//! | [`klog`] | structured logging ring |
//!
//! ## Testing
//!
//! The crate is hosted-testable: `cargo test` exercises every structure and
//! the full blocking/inheritance protocols against [`hal::HostCpu`].

#![cfg_attr(not(test), no_std)]

// For tests, we need the standard library
#[cfg(test)]
extern crate std;

pub mod klog;

pub mod config;
pub mod error;
pub mod hal;
pub mod inherit;
pub mod kernel;
pub mod lock;
pub mod mutex;
pub mod percpu;
pub mod ready;
pub mod scheduler;
pub mod semaphore;
pub mod thread;
pub mod threadq;
pub mod watchdog;

pub use config::{CoreConfig, InstanceConfig, SchedPolicy};
pub use error::{CoreError, FatalCode};
pub use hal::{Cpu, HostCpu, IrqGuard};
pub use kernel::{BlockStatus, Deadline, SchedCore};
pub use mutex::MutexId;
pub use semaphore::SemId;
pub use thread::{Priority, ThreadId, ThreadState, WaitResult};
pub use threadq::{Discipline, QueueId};
pub use watchdog::{WatchdogClass, WatchdogId, WatchdogRef};
