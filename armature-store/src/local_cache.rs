//! Process-local node cache.
//!
//! A tiny same-process tier in front of the fast cache. Entries live for a
//! short fixed window (2 seconds by default) so repeated reads within one
//! request burst skip the network without holding stale nodes long enough
//! to matter.

use armature_core::{Node, NodeId};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(2);

/// Same-process node cache with per-entry expiry.
#[derive(Debug)]
pub struct ProcessCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Node)>>,
}

impl Default for ProcessCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ProcessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(table: &str, id: &NodeId) -> String {
        format!("{table}:{id}")
    }

    /// Fetch a live entry. Expired entries are evicted on the way out.
    pub fn get(&self, table: &str, id: &NodeId) -> Option<Node> {
        let key = Self::key(table, id);
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(&key) {
                Some((stored, node)) if stored.elapsed() < self.ttl => {
                    return Some(node.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&key);
        None
    }

    pub fn put(&self, table: &str, node: &Node) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(Self::key(table, &node.id), (Instant::now(), node.clone()));
    }

    pub fn purge(&self, table: &str, id: &NodeId) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&Self::key(table, id));
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
