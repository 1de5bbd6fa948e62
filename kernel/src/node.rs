//! A node: one machine of the cluster.
//!
//! Owns the page-frame arena, the process table, the ready queue and
//! CPUs, the network lists and the console. Nothing here is global:
//! a test builds as many nodes as it likes and steps them explicitly,
//! which is where the determinism comes from.
//!
//! `step()` is the node's heartbeat: deliver pending network frames,
//! give every CPU one quantum, advance the timer. The scheduler's
//! spin-on-empty-queue loop of a real kernel shows up here as a CPU
//! simply staying idle for the step.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::collections::BTreeMap;
use crossbeam_queue::SegQueue;
use spin::Mutex;

use crate::memory::address_space::{self, insert, new_pdir};
use crate::memory::layout::{Pa, Va, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::paging::{rr_cons, Pte, PteFlags, MAX_NODES};
use crate::memory::PhysMem;
use crate::net::transport::Transport;
use crate::process::table::ProcTable;
use crate::process::{Flow, ProcId, State};
use crate::trap::FL_IF;
use crate::umode::{self, UExit};
use crate::uprog::CodeImage;

/// Per-node tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Page frames in the arena (16 MiB worth at most).
    pub npages: usize,
    /// CPU slots served from the shared ready queue.
    pub ncpus: usize,
    /// Instructions a process may run before the timer yields it.
    pub quantum: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            npages: 1024,
            ncpus: 2,
            quantum: 50,
        }
    }
}

/// Timer ticks between retransmission sweeps of the migration and pull
/// lists.
pub const NET_TICK_INTERVAL: u64 = 64;

#[derive(Debug, Default)]
pub(crate) struct Cpu {
    /// Running process, or 0 when idle.
    pub current: ProcId,
}

pub struct Node {
    id: u8,
    mac: [u8; 6],
    pub mem: PhysMem,
    pub(crate) procs: ProcTable,
    pub(crate) boot_pdir: Vec<Pte>,

    pub(crate) ready: Mutex<VecDeque<ProcId>>,
    pub(crate) cpus: Vec<Mutex<Cpu>>,
    switches: AtomicU64,

    /// Processes waiting for a migration ack, FIFO.
    pub(crate) migrlist: Mutex<VecDeque<ProcId>>,
    /// Processes waiting for page parts, FIFO.
    pub(crate) pulllist: Mutex<VecDeque<ProcId>>,
    /// Home RR -> local process, for processes that arrived here.
    pub(crate) rr_procs: Mutex<BTreeMap<u32, ProcId>>,

    pub(crate) code: Arc<CodeImage>,
    pub(crate) tx: Arc<dyn Transport>,
    rx: Arc<SegQueue<Vec<u8>>>,

    console: Mutex<Vec<u8>>,
    halted: AtomicBool,
    ticks: AtomicU64,
    quantum: u32,
}

impl Node {
    /// Build a node. `rx` is this node's mailbox on the transport.
    pub fn new(
        id: u8,
        config: NodeConfig,
        code: Arc<CodeImage>,
        tx: Arc<dyn Transport>,
        rx: Arc<SegQueue<Vec<u8>>>,
    ) -> Self {
        assert!(id >= 1 && id <= MAX_NODES, "bad node id {id}");
        assert!(config.ncpus >= 1);
        let mut cpus = Vec::with_capacity(config.ncpus);
        for _ in 0..config.ncpus {
            cpus.push(Mutex::new(Cpu::default()));
        }
        Node {
            id,
            mac: crate::net::mac_for(id),
            mem: PhysMem::new(config.npages),
            procs: ProcTable::new(),
            boot_pdir: address_space::make_boot_pdir(),
            ready: Mutex::new(VecDeque::new()),
            cpus,
            switches: AtomicU64::new(0),
            migrlist: Mutex::new(VecDeque::new()),
            pulllist: Mutex::new(VecDeque::new()),
            rr_procs: Mutex::new(BTreeMap::new()),
            code,
            tx,
            rx,
            console: Mutex::new(Vec::new()),
            halted: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            quantum: config.quantum,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// True once the root process returned.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_halted(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Context switches taken so far (dispatches and direct wakes).
    pub fn context_switches(&self) -> u64 {
        self.switches.load(Ordering::SeqCst)
    }

    pub(crate) fn count_switch(&self) {
        self.switches.fetch_add(1, Ordering::SeqCst);
    }

    /// One heartbeat: deliver frames, run every CPU for a quantum,
    /// advance the timer.
    pub fn step(&self) {
        self.poll_net();
        for cpu in 0..self.cpus.len() {
            self.step_cpu(cpu);
        }
        let t = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if t % NET_TICK_INTERVAL == 0 {
            self.net_tick();
        }
    }

    fn poll_net(&self) {
        while let Some(frame) = self.rx.pop() {
            self.net_rx(&frame);
        }
    }

    fn step_cpu(&self, cpu: usize) {
        let mut cur = self.cpus[cpu].lock().current;
        if cur == 0 {
            cur = match self.sched_dispatch(cpu) {
                Some(p) => p,
                None => return, // nothing runnable; idle this step
            };
        }

        let mut tf = self.procs.get(cur).sv.tf;
        let mut pdir = self.procs.get(cur).pdir;
        let mut budget = self.quantum;

        loop {
            let exit = umode::run(self, pdir, &mut tf, &mut budget);
            let flow = match exit {
                UExit::Syscall => self.syscall_dispatch(cur, &mut tf),
                UExit::Trap => {
                    // An unhandled user trap suspends the process and
                    // reflects the trapframe to its parent.
                    self.proc_ret(cur, &tf, -1)
                }
                UExit::Quantum => {
                    self.proc_yield(cur, &tf);
                    self.cpus[cpu].lock().current = 0;
                    return;
                }
            };
            match flow {
                Flow::Resume => continue,
                Flow::Switch(next) => {
                    self.proc_run(next, cpu);
                    cur = next;
                    tf = self.procs.get(cur).sv.tf;
                    pdir = self.procs.get(cur).pdir;
                }
                Flow::Idle => {
                    self.cpus[cpu].lock().current = 0;
                    return;
                }
            }
        }
    }

    /// Allocate a child process in slot `cn` of `parent` (no parent if
    /// 0): fresh page directories, home pointing at this node,
    /// stopped. `None` on slot or memory exhaustion.
    pub(crate) fn proc_alloc(&self, parent: ProcId, cn: usize) -> Option<ProcId> {
        let id = self.procs.reserve()?;
        let pdir = match new_pdir(&self.mem, &self.boot_pdir) {
            Some(pa) => pa,
            None => {
                self.procs.release(id);
                return None;
            }
        };
        let rpdir = match new_pdir(&self.mem, &self.boot_pdir) {
            Some(pa) => pa,
            None => {
                self.mem
                    .decref(pdir, crate::memory::frame_metadata::FrameKind::PageDir);
                self.procs.release(id);
                return None;
            }
        };
        {
            let mut p = self.procs.get(id);
            p.parent = parent;
            p.pdir = pdir;
            p.rpdir = rpdir;
            p.home = rr_cons(self.id, (id as u32) << PAGE_SHIFT, PteFlags::empty());
            p.sv.tf.eflags = FL_IF;
        }
        if parent != 0 {
            self.procs.get(parent).child[cn] = id;
        }
        log::debug!("node {}: allocated proc {} (parent {})", self.id, id, parent);
        Some(id)
    }

    /// Create and enqueue the root process, entering the code image at
    /// `entry_ip`. The stand-in for the out-of-scope ELF loader.
    pub fn spawn_root(&self, entry_ip: u32) -> ProcId {
        let root = self
            .proc_alloc(0, 0)
            .expect("spawn_root: no memory for root process");
        self.procs.get(root).sv.tf.eip = entry_ip;
        self.proc_ready(root);
        root
    }

    /// Map `data` into a process's address space at `va` (page
    /// aligned), one freshly allocated frame per page. Bootstrap seam
    /// for building the initial image of a root process.
    pub fn map_image(&self, pid: ProcId, va: Va, data: &[u8], writable: bool) {
        assert_eq!(va as usize % PAGE_SIZE, 0, "unaligned image base");
        let pdir = self.procs.get(pid).pdir;
        let perm = if writable {
            PteFlags::U | PteFlags::W | PteFlags::SYS_RW
        } else {
            PteFlags::U | PteFlags::SYS_READ
        };
        let mut off = 0usize;
        while off < data.len() {
            let frame = self.mem.alloc().expect("map_image: out of memory");
            self.mem.zero_page(frame);
            let chunk = core::cmp::min(PAGE_SIZE, data.len() - off);
            self.mem.copy_in(frame, &data[off..off + chunk]);
            insert(&self.mem, pdir, frame, va + off as u32, perm)
                .expect("map_image: out of memory for page table");
            off += PAGE_SIZE;
        }
    }

    /// The process's page directory, for tests and bootstrap code.
    pub fn pdir_of(&self, pid: ProcId) -> Pa {
        self.procs.get(pid).pdir
    }

    /// The process occupying child slot `slot` of `pid`, 0 if none.
    pub fn child_of(&self, pid: ProcId, slot: usize) -> ProcId {
        self.procs.get(pid).child[slot]
    }

    pub fn state_of(&self, pid: ProcId) -> State {
        self.procs.get(pid).state
    }

    /// Saved register state of a stopped process.
    pub fn saved_state(&self, pid: ProcId) -> crate::trap::ProcState {
        self.procs.get(pid).sv
    }

    pub(crate) fn console_write(&self, bytes: &[u8]) {
        self.console.lock().extend_from_slice(bytes);
    }

    /// Drain everything the node has printed.
    pub fn console_take(&self) -> String {
        let bytes = core::mem::take(&mut *self.console.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Peek at console contents without draining.
    pub fn console_peek(&self) -> String {
        String::from_utf8_lossy(&self.console.lock()).into_owned()
    }
}

/// Convenience for spinning a single node in tests: step until `pred`
/// or panic after `max_steps`.
pub fn run_node_until<F: FnMut(&Node) -> bool>(node: &Node, mut pred: F, max_steps: u64) {
    for _ in 0..max_steps {
        if pred(node) {
            return;
        }
        node.step();
    }
    panic!("node {} made no progress in {} steps", node.id(), max_steps);
}
