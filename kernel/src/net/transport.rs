//! The transport seam and the in-memory Ethernet hub.
//!
//! A node only ever calls [`Transport::send`]; what is on the other
//! side, a real NIC driver or the test hub, is not its business.
//! [`EtherHub`] routes frames between in-process nodes by the
//! destination MAC's node byte, with an optional deterministic drop
//! hook so tests can lose packets on purpose and watch retransmission
//! repair the damage.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use spin::Mutex;

pub trait Transport: Send + Sync {
    /// Queue one raw frame for delivery. Unreliable: the frame may be
    /// dropped without notice.
    fn send(&self, frame: &[u8]);
}

type DropHook = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// An unreliable broadcast-domain hub connecting the cluster's nodes.
pub struct EtherHub {
    ports: Mutex<BTreeMap<u8, Arc<SegQueue<Vec<u8>>>>>,
    drop_hook: Mutex<Option<DropHook>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl EtherHub {
    pub fn new() -> Arc<Self> {
        Arc::new(EtherHub {
            ports: Mutex::new(BTreeMap::new()),
            drop_hook: Mutex::new(None),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Attach a node, returning its receive mailbox.
    pub fn register(&self, node: u8) -> Arc<SegQueue<Vec<u8>>> {
        let q = Arc::new(SegQueue::new());
        let prev = self.ports.lock().insert(node, q.clone());
        assert!(prev.is_none(), "node {node} registered twice");
        q
    }

    /// Install a fault filter: return true to drop the frame. Called
    /// with every frame in send order, so counting filters are
    /// deterministic.
    pub fn set_drop_hook(&self, hook: DropHook) {
        *self.drop_hook.lock() = Some(hook);
    }

    pub fn clear_drop_hook(&self) {
        *self.drop_hook.lock() = None;
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Transport for EtherHub {
    fn send(&self, frame: &[u8]) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        if frame.len() < super::HDR_LEN {
            log::warn!("hub: refusing runt frame");
            return;
        }
        if let Some(hook) = self.drop_hook.lock().as_mut() {
            if hook(frame) {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                log::debug!("hub: dropped a frame to node {}", frame[5]);
                return;
            }
        }
        let dst = frame[5];
        match self.ports.lock().get(&dst) {
            Some(q) => q.push(frame.to_vec()),
            None => log::warn!("hub: frame for unknown node {}", dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mac_for;

    fn frame_to(node: u8) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&mac_for(node));
        f.extend_from_slice(&mac_for(1));
        f.extend_from_slice(&crate::net::ETHERTYPE.to_be_bytes());
        f.push(0);
        f
    }

    #[test]
    fn routes_by_node_byte() {
        let hub = EtherHub::new();
        let rx2 = hub.register(2);
        let rx3 = hub.register(3);
        hub.send(&frame_to(2));
        assert!(rx2.pop().is_some());
        assert!(rx3.pop().is_none());
    }

    #[test]
    fn drop_hook_is_deterministic() {
        let hub = EtherHub::new();
        let rx2 = hub.register(2);
        let mut n = 0u32;
        hub.set_drop_hook(Box::new(move |_| {
            n += 1;
            n == 1 // lose exactly the first frame
        }));
        hub.send(&frame_to(2));
        hub.send(&frame_to(2));
        assert_eq!(hub.frames_dropped(), 1);
        assert!(rx2.pop().is_some());
        assert!(rx2.pop().is_none());
    }
}
