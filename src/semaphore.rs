//! Counting Semaphores
//!
//! Semaphore object state: a count plus a wait queue whose discipline (FIFO
//! or priority) is chosen at creation. Obtain/release protocol lives in
//! [`crate::kernel`].

use crate::config::MAX_SEMAPHORES;
use crate::error::{fatal, CoreError, FatalCode};
use crate::threadq::{Discipline, ThreadQueue};

/// Stable semaphore handle: arena slot plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemId {
    pub(crate) slot: u16,
    pub(crate) gen: u16,
}

impl SemId {
    pub fn raw(self) -> u32 {
        (self.gen as u32) << 16 | self.slot as u32
    }
}

/// A counting semaphore.
pub struct CoreSemaphore {
    pub id: SemId,
    pub(crate) count: u32,
    pub(crate) queue: ThreadQueue,
}

impl CoreSemaphore {
    fn new(id: SemId, initial: u32, discipline: Discipline) -> Self {
        Self {
            id,
            count: initial,
            queue: ThreadQueue::new(discipline),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn waiter_count(&self) -> usize {
        self.queue.len()
    }
}

/// Fixed-capacity semaphore storage with generation-checked handles.
pub struct SemArena {
    slots: [Option<CoreSemaphore>; MAX_SEMAPHORES],
    gens: [u16; MAX_SEMAPHORES],
}

impl SemArena {
    pub const fn new() -> Self {
        const EMPTY: Option<CoreSemaphore> = None;
        Self {
            slots: [EMPTY; MAX_SEMAPHORES],
            gens: [0; MAX_SEMAPHORES],
        }
    }

    pub fn create(&mut self, initial: u32, discipline: Discipline) -> Result<SemId, CoreError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(CoreError::NoSlot)?;
        let id = SemId {
            slot: slot as u16,
            gen: self.gens[slot],
        };
        self.slots[slot] = Some(CoreSemaphore::new(id, initial, discipline));
        Ok(id)
    }

    /// Free a semaphore slot; the kernel flushes waiters first.
    pub fn destroy(&mut self, id: SemId) -> Result<(), CoreError> {
        let s = self.get(id).ok_or(CoreError::InvalidId)?;
        if !s.queue.is_empty() {
            fatal(FatalCode::StateCorruption);
        }
        let slot = id.slot as usize;
        self.slots[slot] = None;
        self.gens[slot] = self.gens[slot].wrapping_add(1);
        Ok(())
    }

    pub fn get(&self, id: SemId) -> Option<&CoreSemaphore> {
        let slot = id.slot as usize;
        if slot >= MAX_SEMAPHORES || self.gens[slot] != id.gen {
            return None;
        }
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, id: SemId) -> Option<&mut CoreSemaphore> {
        let slot = id.slot as usize;
        if slot >= MAX_SEMAPHORES || self.gens[slot] != id.gen {
            return None;
        }
        self.slots[slot].as_mut()
    }
}
