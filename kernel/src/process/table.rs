//! The per-node process slot table.

use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use super::{ProcId, Process, State, NPROC};

/// Fixed arena of process slots. Slot 0 is reserved at construction;
/// the rest start `Free`. Slots are locked individually; the locking
/// discipline never holds two at once.
pub struct ProcTable {
    slots: Vec<Mutex<Process>>,
}

impl ProcTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NPROC);
        for i in 0..NPROC {
            let mut p = Process::new();
            if i == 0 {
                p.state = State::Reserved;
            }
            slots.push(Mutex::new(p));
        }
        ProcTable { slots }
    }

    pub fn get(&self, id: ProcId) -> MutexGuard<'_, Process> {
        self.slots[id as usize].lock()
    }

    /// True if `id` names a real slot (reserved slot 0 excluded).
    pub fn is_valid(&self, id: ProcId) -> bool {
        id != 0 && (id as usize) < NPROC
    }

    /// Claim a free slot, leaving it in `Stop`. `None` when the table
    /// is full.
    pub fn reserve(&self) -> Option<ProcId> {
        for i in 1..NPROC {
            let mut p = self.slots[i].lock();
            if p.state == State::Free {
                *p = Process::new();
                p.state = State::Stop;
                return Some(i as ProcId);
            }
        }
        None
    }

    /// Return a reserved slot on an aborted allocation.
    pub fn release(&self, id: ProcId) {
        let mut p = self.get(id);
        debug_assert_eq!(p.state, State::Stop);
        p.state = State::Free;
    }

    /// Snapshot a process's state without holding the lock.
    pub fn state_of(&self, id: ProcId) -> State {
        self.get(id).state
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}
