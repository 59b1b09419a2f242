//! Realtime store abstraction.
//!
//! Every exchange between clients, servers and operators goes through a
//! tree-structured key-value store with "child added" notifications. The
//! [`Store`] trait captures the handful of primitives the tunnels need:
//!
//! | Operation   | Semantics                                                  |
//! |-------------|------------------------------------------------------------|
//! | `push`      | append a child under a generated, time-ordered key         |
//! | `set`       | replace the value at a path (`null` removes it)            |
//! | `update`    | merge fields into the object at a path                     |
//! | `remove`    | delete a path; idempotent                                  |
//! | `get`       | read the current value once                                |
//! | `subscribe` | yield each child once, existing ones first, in key order   |
//!
//! Two backends exist: [`rtdb::RtdbStore`] talks to a Realtime Database over
//! REST + server-sent events, [`memory::MemoryStore`] keeps the tree in
//! process for single-node use and tests.

pub mod memory;
pub mod rtdb;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use rtdb::RtdbStore;

/// Shared handle used throughout the crate.
pub type SharedStore = Arc<dyn Store>;

/// A child delivered by a [`Subscription`].
#[derive(Debug, Clone)]
pub struct Child {
    /// Generated key of the child (its arrival position).
    pub key: String,
    /// Full path of the child, suitable for [`Store::remove`].
    pub path: String,
    pub value: Value,
}

/// Stream of children appended under one path.
///
/// Dropping the subscription detaches the listener.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Child>,
    _guard: Option<DropGuard>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Child>, guard: Option<DropGuard>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next child, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<Child> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Append `value` under a fresh time-ordered key; returns the key.
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Replace the value at `path`. Writing `null` removes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge `fields` into the object at `path`. Field names may contain `/`
    /// to address nested children.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Delete `path` and everything below it. Removing a missing path is not
    /// an error.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Read the value at `path` once.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Subscribe to children of `path`: every child present now, then every
    /// child added later, each delivered once in key order.
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;
}

/// Open the store selected by configuration.
pub fn open(config: &StoreConfig) -> Result<SharedStore, StoreError> {
    match &config.url {
        Some(url) => Ok(Arc::new(RtdbStore::new(config, url)?)),
        None => {
            warn!("No store URL configured; using the in-process memory store (single node only)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Join a base path and a child key.
pub fn child_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}/{key}")
    }
}

/// Split a path into its segments, rejecting characters the store forbids.
pub fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let mut out = Vec::new();
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        if seg.chars().any(|c| matches!(c, '.' | '#' | '$' | '[' | ']') || c.is_control()) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        out.push(seg);
    }
    Ok(out)
}

// ─── Push ids ──────────────────────────────────────────────────────

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Generator of 20-character, lexicographically time-ordered keys.
///
/// The first 8 characters encode the millisecond timestamp, the remaining 12
/// are random. Keys generated in the same millisecond increment the random
/// part so ordering stays strict.
pub struct PushIdGenerator {
    last_ms: u64,
    last_rand: [u8; 12],
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self {
            last_ms: 0,
            last_rand: [0; 12],
        }
    }

    pub fn next_id(&mut self, now_ms: u64) -> String {
        if now_ms <= self.last_ms {
            // Same (or earlier) millisecond: bump the random suffix.
            for slot in self.last_rand.iter_mut().rev() {
                if *slot == 63 {
                    *slot = 0;
                } else {
                    *slot += 1;
                    break;
                }
            }
        } else {
            self.last_ms = now_ms;
            let random = uuid::Uuid::new_v4();
            for (slot, byte) in self.last_rand.iter_mut().zip(random.as_bytes()) {
                *slot = byte % 64;
            }
        }

        let mut id = [0u8; 20];
        let mut ts = self.last_ms;
        for slot in id[..8].iter_mut().rev() {
            *slot = PUSH_CHARS[(ts % 64) as usize];
            ts /= 64;
        }
        for (slot, r) in id[8..].iter_mut().zip(self.last_rand) {
            *slot = PUSH_CHARS[r as usize];
        }
        String::from_utf8_lossy(&id).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_ids_are_strictly_ordered() {
        let mut generator = PushIdGenerator::new();
        let mut ids = vec![
            generator.next_id(1_000),
            generator.next_id(1_000),
            generator.next_id(1_000),
            generator.next_id(999),
            generator.next_id(2_000),
        ];
        assert!(ids.iter().all(|id| id.len() == 20));
        let produced = ids.clone();
        ids.sort();
        assert_eq!(ids, produced);
        ids.dedup();
        assert_eq!(ids.len(), produced.len());
    }

    #[test]
    fn segments_reject_forbidden_characters() {
        assert_eq!(
            segments("sessions/abc/ssh/input").unwrap(),
            vec!["sessions", "abc", "ssh", "input"]
        );
        assert_eq!(segments("/servers//x/").unwrap(), vec!["servers", "x"]);
        assert!(segments("sessions/a.b").is_err());
        assert!(segments("sessions/$x").is_err());
    }

    #[test]
    fn child_path_joins() {
        assert_eq!(child_path("a/b", "c"), "a/b/c");
        assert_eq!(child_path("", "c"), "c");
    }
}
