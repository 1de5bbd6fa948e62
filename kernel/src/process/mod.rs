//! Processes: slot-table storage, hierarchical child links, states.
//!
//! Processes live in a fixed per-node slot table and are named by
//! their slot index ([`ProcId`]); slot 0 is reserved, so 0 doubles as
//! "no process" in parent and child links. The ready, migration and
//! pull queues hold `ProcId`s, and a process is on at most one of them
//! at a time; its state says which.

pub mod sched;
pub mod table;

use crate::memory::layout::{Pa, Va};
use crate::memory::paging::Rr;
use crate::trap::{Entry, ProcState};

/// Slot index into a node's process table. Slot 0 is the reserved null
/// process, so a zero `ProcId` means "none".
pub type ProcId = u16;

/// Process-table slots per node.
pub const NPROC: usize = 64;

/// Child slots per process.
pub const NCHILD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Unallocated slot.
    Free,
    /// Slot 0 scratch; never schedulable.
    Reserved,
    /// Stopped: the rendezvous state. Parents may operate on it.
    Stop,
    /// On the ready queue.
    Ready,
    /// Running on some CPU.
    Run,
    /// Blocked waiting for `waitchild` to stop.
    Wait,
    /// On the migration list, waiting for the destination's ack.
    Migr,
    /// On the pull list, waiting for page parts.
    Pull,
    /// Living on another node.
    Away,
}

/// Page-structure level of a pull target: a plain page, a page table,
/// or a page directory. Carried on the wire, so plain constants.
pub const PGLEV_PAGE: u8 = 0;
pub const PGLEV_PTAB: u8 = 1;
pub const PGLEV_PDIR: u8 = 2;

#[derive(Debug)]
pub struct Process {
    pub state: State,
    pub parent: ProcId,
    pub child: [ProcId; NCHILD],

    /// Saved register state and the entry kind it was saved with.
    pub sv: ProcState,
    pub entry: Entry,

    /// Owning page directory and the reference (snapshot) directory.
    pub pdir: Pa,
    pub rpdir: Pa,
    /// Previous page directory of a process that just migrated in,
    /// kept alive until its pages have been pulled (frames it owns are
    /// the authoritative copies the pull resolves to).
    pub oldpdir: Pa,

    /// Child the process is blocked on while `Wait`.
    pub waitchild: ProcId,

    /// CPU currently running this process, while `Run`.
    pub runcpu: Option<usize>,

    /// Remote reference naming this process at its home node.
    pub home: Rr,
    /// Migration destination, while `Migr`.
    pub migrdest: u8,
    /// Remote reference to the away pdir, adopted on arrival.
    pub rrpdir: Rr,

    /// Pull bookkeeping: resume address of the sweep, the reference
    /// being pulled, its level, the local target frame, and the bitmap
    /// of arrived parts.
    pub pullva: Va,
    pub pullrr: Rr,
    pub pull_level: u8,
    pub pullpg: Pa,
    pub arrived: u8,
}

impl Process {
    pub fn new() -> Self {
        Process {
            state: State::Free,
            parent: 0,
            child: [0; NCHILD],
            sv: ProcState::default(),
            entry: -1,
            pdir: 0,
            rpdir: 0,
            oldpdir: 0,
            waitchild: 0,
            runcpu: None,
            home: 0,
            migrdest: 0,
            rrpdir: 0,
            pullva: 0,
            pullrr: 0,
            pull_level: PGLEV_PAGE,
            pullpg: 0,
            arrived: 0,
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

/// What a CPU does after a kernel entry is handled: go back to the
/// same process, switch to another one, or fall into the scheduler.
/// This is the value-typed form of the original's noreturn
/// `trap_return` / `proc_run` / `proc_sched` tail calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Resume,
    Switch(ProcId),
    Idle,
}
