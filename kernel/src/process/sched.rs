//! Scheduling and the process state machine.
//!
//! One FIFO ready queue per node, shared by all CPUs. Everything here
//! returns a [`Flow`] instead of tail-calling into the scheduler: the
//! CPU step loop consumes it and either keeps running the same
//! process, switches to another, or goes idle.

use crate::memory::paging::rr_node;
use crate::node::Node;
use crate::process::{Flow, ProcId, State};
use crate::trap::{Entry, Trapframe, T_SYSCALL};

impl Node {
    /// Copy the live trapframe into the process. Entry kind 0 rewinds
    /// the instruction pointer by the one-instruction syscall width so
    /// the syscall re-executes on wake.
    pub(crate) fn proc_save(&self, pid: ProcId, tf: &Trapframe, entry: Entry) {
        let mut p = self.procs.get(pid);
        p.sv.tf = *tf;
        p.entry = entry;
        if entry == 0 {
            p.sv.tf.eip = p.sv.tf.eip.wrapping_sub(1);
        }
    }

    /// Put a stopped or freshly saved process on the ready queue.
    pub(crate) fn proc_ready(&self, pid: ProcId) {
        {
            let mut p = self.procs.get(pid);
            debug_assert!(
                p.state != State::Ready,
                "proc {} already on the ready queue",
                pid
            );
            p.state = State::Ready;
        }
        self.ready.lock().push_back(pid);
    }

    /// Pop the ready queue head and install it on `cpu`. `None` leaves
    /// the CPU idle for this step.
    pub(crate) fn sched_dispatch(&self, cpu: usize) -> Option<ProcId> {
        let pid = self.ready.lock().pop_front()?;
        self.proc_run(pid, cpu);
        Some(pid)
    }

    /// Switch `cpu` to `pid`.
    pub(crate) fn proc_run(&self, pid: ProcId, cpu: usize) {
        {
            let mut p = self.procs.get(pid);
            debug_assert!(
                matches!(p.state, State::Ready | State::Wait),
                "running proc {} in state {:?}",
                pid,
                p.state
            );
            p.state = State::Run;
            p.runcpu = Some(cpu);
        }
        self.cpus[cpu].lock().current = pid;
        self.count_switch();
        log::trace!("node {}: cpu {} runs proc {}", self.id(), cpu, pid);
    }

    /// Timer preemption: requeue the current process, entry kind -1.
    pub(crate) fn proc_yield(&self, pid: ProcId, tf: &Trapframe) {
        self.proc_save(pid, tf, -1);
        self.procs.get(pid).runcpu = None;
        self.proc_ready(pid);
    }

    /// Block `parent` until `child` stops. Saved with entry kind 0, so
    /// the rendezvous syscall re-executes when the parent wakes.
    pub(crate) fn proc_wait(&self, parent: ProcId, child: ProcId, tf: &Trapframe) -> Flow {
        self.proc_save(parent, tf, 0);
        let mut p = self.procs.get(parent);
        p.state = State::Wait;
        p.waitchild = child;
        p.runcpu = None;
        log::trace!("node {}: proc {} waits for child {}", self.id(), parent, child);
        Flow::Idle
    }

    /// Stop the current process, returning control to its parent.
    /// Used by the RET syscall, by trap reflection (entry -1) and by
    /// aborted syscalls (entry 0). A process away from its home node
    /// migrates home instead and re-enters here on arrival.
    pub(crate) fn proc_ret(&self, pid: ProcId, tf: &Trapframe, entry: Entry) -> Flow {
        let (parent, home) = {
            let p = self.procs.get(pid);
            (p.parent, p.home)
        };

        if rr_node(home) != self.id() {
            // Syscalls re-execute at home; traps re-raise there.
            let mentry = if entry == 1 { 0 } else { entry };
            return self.net_migrate(pid, tf, rr_node(home), mentry);
        }

        if parent == 0 {
            // The root process has no parent to return to. A clean RET
            // halts the node; an unhandled trap is fatal.
            if tf.trapno != T_SYSCALL {
                panic!(
                    "node {}: trap {} in root process at eip {:#x}",
                    self.id(),
                    tf.trapno,
                    tf.eip
                );
            }
            self.proc_save(pid, tf, entry);
            self.procs.get(pid).state = State::Stop;
            self.procs.get(pid).runcpu = None;
            self.set_halted();
            log::info!("node {}: root process returned, halting", self.id());
            return Flow::Idle;
        }

        self.proc_save(pid, tf, entry);
        {
            let mut p = self.procs.get(pid);
            p.state = State::Stop;
            p.runcpu = None;
        }

        // If the parent is blocked on exactly this child, hand it the
        // CPU directly.
        let wake = {
            let mut par = self.procs.get(parent);
            if par.state == State::Wait && par.waitchild == pid {
                par.waitchild = 0;
                true
            } else {
                false
            }
        };
        if wake {
            log::trace!("node {}: child {} stops, waking parent {}", self.id(), pid, parent);
            Flow::Switch(parent)
        } else {
            Flow::Idle
        }
    }
}
