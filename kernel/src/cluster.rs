//! A cluster: several nodes on one hub, stepped round-robin.
//!
//! The harness the end-to-end scenarios run on. Stepping is explicit
//! and deterministic: every `step()` polls each node once, in node-id
//! order.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::net::transport::EtherHub;
use crate::node::{Node, NodeConfig};
use crate::uprog::CodeImage;

pub struct Cluster {
    nodes: Vec<Arc<Node>>,
    hub: Arc<EtherHub>,
    steps: u64,
}

impl Cluster {
    /// Build `n` nodes (ids 1..=n) sharing one code image and hub.
    pub fn new(n: usize, config: NodeConfig, code: Arc<CodeImage>) -> Self {
        let hub = EtherHub::new();
        let mut nodes = Vec::with_capacity(n);
        for id in 1..=n as u8 {
            let rx = hub.register(id);
            nodes.push(Arc::new(Node::new(
                id,
                config,
                code.clone(),
                hub.clone(),
                rx,
            )));
        }
        Cluster {
            nodes,
            hub,
            steps: 0,
        }
    }

    /// One node with default tuning; plenty for single-machine tests.
    pub fn new_single(code: Arc<CodeImage>) -> Self {
        Self::new(1, NodeConfig::default(), code)
    }

    pub fn node(&self, id: u8) -> &Arc<Node> {
        &self.nodes[(id - 1) as usize]
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn hub(&self) -> &Arc<EtherHub> {
        &self.hub
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    pub fn step(&mut self) {
        for node in &self.nodes {
            node.step();
        }
        self.steps += 1;
    }

    /// Step until `pred` holds; panic after `max_steps` so a wedged
    /// protocol fails a test instead of hanging it.
    pub fn run_until<F: FnMut(&Cluster) -> bool>(&mut self, mut pred: F, max_steps: u64) {
        for _ in 0..max_steps {
            if pred(self) {
                return;
            }
            self.step();
        }
        panic!("cluster made no progress in {max_steps} steps");
    }
}
