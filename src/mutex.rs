//! Core Mutex Objects
//!
//! The mutex object proper: holder tracking plus a priority-inheriting wait
//! queue. The acquire/release protocol - blocking, inheritance walks,
//! ownership hand-off - is composed in [`crate::kernel`]; this module keeps
//! the object state and its arena.

use crate::config::MAX_MUTEXES;
use crate::error::{fatal, CoreError, FatalCode};
use crate::threadq::{Discipline, ThreadQueue};

/// Stable mutex handle: arena slot plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexId {
    pub(crate) slot: u16,
    pub(crate) gen: u16,
}

impl MutexId {
    pub fn raw(self) -> u32 {
        (self.gen as u32) << 16 | self.slot as u32
    }
}

/// A priority-inheriting mutex.
pub struct CoreMutex {
    pub id: MutexId,
    /// Slot of the owning thread, if held
    pub(crate) holder: Option<u16>,
    /// Waiters in effective-priority order
    pub(crate) queue: ThreadQueue,
}

impl CoreMutex {
    fn new(id: MutexId) -> Self {
        Self {
            id,
            holder: None,
            queue: ThreadQueue::new(Discipline::PriorityInherit),
        }
    }

    pub fn holder_slot(&self) -> Option<u16> {
        self.holder
    }

    pub fn waiter_count(&self) -> usize {
        self.queue.len()
    }
}

/// Fixed-capacity mutex storage with generation-checked handles.
pub struct MutexArena {
    slots: [Option<CoreMutex>; MAX_MUTEXES],
    gens: [u16; MAX_MUTEXES],
}

impl MutexArena {
    pub const fn new() -> Self {
        const EMPTY: Option<CoreMutex> = None;
        Self {
            slots: [EMPTY; MAX_MUTEXES],
            gens: [0; MAX_MUTEXES],
        }
    }

    pub fn create(&mut self) -> Result<MutexId, CoreError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(CoreError::NoSlot)?;
        let id = MutexId {
            slot: slot as u16,
            gen: self.gens[slot],
        };
        self.slots[slot] = Some(CoreMutex::new(id));
        Ok(id)
    }

    /// Free a mutex slot. The kernel flushes waiters and strips inheritance
    /// first; a populated queue here means that protocol was skipped.
    pub fn destroy(&mut self, id: MutexId) -> Result<(), CoreError> {
        let m = self.get(id).ok_or(CoreError::InvalidId)?;
        if !m.queue.is_empty() {
            fatal(FatalCode::StateCorruption);
        }
        let slot = id.slot as usize;
        self.slots[slot] = None;
        self.gens[slot] = self.gens[slot].wrapping_add(1);
        Ok(())
    }

    pub fn get(&self, id: MutexId) -> Option<&CoreMutex> {
        let slot = id.slot as usize;
        if slot >= MAX_MUTEXES || self.gens[slot] != id.gen {
            return None;
        }
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, id: MutexId) -> Option<&mut CoreMutex> {
        let slot = id.slot as usize;
        if slot >= MAX_MUTEXES || self.gens[slot] != id.gen {
            return None;
        }
        self.slots[slot].as_mut()
    }
}
