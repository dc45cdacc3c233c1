use crate::stats::bucket::{Connection, PerSecondBucket};
use std::collections::{HashMap, VecDeque};

// Larger windows grow on demand.
const MAX_PREALLOCATED: usize = 1024;

/// Usage counts over the last `window` finalized seconds.
///
/// Only answers "was this seen recently?". Each pushed second holds one
/// reference per distinct connection and protocol it contained; references
/// are released as the second slides out, and an entity whose count reaches
/// zero is forgotten.
#[derive(Debug, Clone)]
pub struct RecentHistoryWindow {
    window:      usize,
    seconds:     VecDeque<(Vec<Connection>, Vec<String>)>,
    connections: HashMap<Connection, u32>,
    protocols:   HashMap<String, u32>,
}

impl RecentHistoryWindow {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            seconds: VecDeque::with_capacity(window.saturating_add(1).min(MAX_PREALLOCATED)),
            connections: HashMap::new(),
            protocols: HashMap::new(),
        }
    }

    pub fn is_new_connection(&self, connection: &Connection) -> bool {
        !self.connections.contains_key(connection)
    }

    pub fn is_new_protocol(&self, protocol: &str) -> bool {
        !self.protocols.contains_key(protocol)
    }

    /// Folds a finalized bucket in, then ages out seconds beyond the window.
    pub fn push(&mut self, bucket: &PerSecondBucket) {
        let connections: Vec<Connection> = bucket.connections.iter().cloned().collect();
        let protocols: Vec<String> = bucket.protocol_counts.keys().cloned().collect();

        for c in &connections {
            *self.connections.entry(c.clone()).or_insert(0) += 1;
        }
        for p in &protocols {
            *self.protocols.entry(p.clone()).or_insert(0) += 1;
        }
        self.seconds.push_back((connections, protocols));

        while self.seconds.len() > self.window {
            let Some((old_connections, old_protocols)) = self.seconds.pop_front() else {
                break;
            };
            for c in old_connections {
                release(&mut self.connections, c);
            }
            for p in old_protocols {
                release(&mut self.protocols, p);
            }
        }
    }

    /// Number of seconds currently held.
    pub fn len(&self) -> usize {
        self.seconds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seconds.is_empty()
    }
}

fn release<K: std::hash::Hash + Eq>(usage: &mut HashMap<K, u32>, key: K) {
    if let Some(count) = usage.get_mut(&key) {
        *count -= 1;
        if *count == 0 {
            usage.remove(&key);
        }
    }
}
