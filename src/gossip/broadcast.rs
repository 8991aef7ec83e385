//! Transmit-limited broadcast queue.
//!
//! Pending broadcasts are retransmitted a bounded number of times that
//! scales with the logarithm of the cluster size, then dropped; the
//! periodic anti-entropy exchange reconciles anything lost on the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct QueuedBroadcast {
    payload: Vec<u8>,
    transmits: u32,
}

pub struct BroadcastQueue {
    queue: Mutex<Vec<QueuedBroadcast>>,
    cluster_size: Arc<AtomicUsize>,
    retransmit_mult: u32,
}

impl BroadcastQueue {
    pub fn new(cluster_size: Arc<AtomicUsize>, retransmit_mult: u32) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            cluster_size,
            retransmit_mult,
        }
    }

    pub fn queue(&self, payload: Vec<u8>) {
        self.queue.lock().unwrap().push(QueuedBroadcast {
            payload,
            transmits: 0,
        });
    }

    /// Drain up to `limit - overhead·k` bytes of pending broadcasts,
    /// bumping each drained message's transmit count and retiring messages
    /// that reached their retransmit bound.
    pub fn drain(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let max_transmits = self.retransmit_limit();
        let mut queue = self.queue.lock().unwrap();

        let mut out = Vec::new();
        let mut used = 0;
        queue.retain_mut(|broadcast| {
            let cost = overhead + broadcast.payload.len();
            if used + cost > limit {
                return true;
            }
            used += cost;
            broadcast.transmits += 1;
            out.push(broadcast.payload.clone());
            broadcast.transmits < max_transmits
        });
        out
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retransmit_limit(&self) -> u32 {
        let nodes = self.cluster_size.load(Ordering::Relaxed).max(1);
        let scale = ((nodes + 1) as f64).log10().ceil().max(1.0) as u32;
        self.retransmit_mult * scale
    }
}
