//! In-process store backend.
//!
//! Holds the whole tree as a [`serde_json::Value`] behind a mutex. Each
//! subscriber remembers which child keys it has already been shown; after every
//! mutation the new keys are delivered in sorted order, which for push ids is
//! arrival order. Empty objects are pruned so a drained mailbox disappears from
//! the tree, as it does in the hosted database.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{child_path, segments, Child, PushIdGenerator, Store, Subscription};
use crate::error::StoreError;
use crate::util::now_ms;

struct Subscriber {
    path: String,
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<Child>,
}

struct Inner {
    root: Value,
    subscribers: Vec<Subscriber>,
    ids: PushIdGenerator,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Value::Object(Map::new()),
                subscribers: Vec::new(),
                ids: PushIdGenerator::new(),
            }),
        }
    }

    /// Number of live subscriptions on exactly `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        let path = normalize(path);
        inner.subscribers.iter().filter(|s| s.path == path).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the tree consistent (every
        // mutation is a single call), so poisoning is ignored.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut Inner),
    {
        let mut inner = self.lock();
        f(&mut inner);
        notify(&mut inner);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let segs = owned_segments(path)?;
        let mut key = String::new();
        self.mutate(|inner| {
            key = inner.ids.next_id(now_ms());
            let mut full = segs;
            full.push(key.clone());
            write(&mut inner.root, &full, value);
        });
        Ok(key)
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = owned_segments(path)?;
        self.mutate(|inner| write(&mut inner.root, &segs, value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let base = owned_segments(path)?;
        let mut writes = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let mut full = base.clone();
            full.extend(owned_segments(&name)?);
            writes.push((full, value));
        }
        self.mutate(|inner| {
            for (segs, value) in writes {
                write(&mut inner.root, &segs, value);
            }
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let segs = owned_segments(path)?;
        self.mutate(|inner| write(&mut inner.root, &segs, Value::Null));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = owned_segments(path)?;
        let inner = self.lock();
        Ok(lookup(&inner.root, &segs).cloned())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        owned_segments(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.subscribers.push(Subscriber {
            path: normalize(path),
            seen: HashSet::new(),
            tx,
        });
        notify(&mut inner);
        Ok(Subscription::new(rx, None))
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn owned_segments(path: &str) -> Result<Vec<String>, StoreError> {
    Ok(segments(path)?.into_iter().map(str::to_string).collect())
}

fn lookup<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Write `value` at `segs`, creating intermediate objects. `null` (or an empty
/// object) deletes, and parents left empty are pruned.
fn write(root: &mut Value, segs: &[String], value: Value) {
    let deleting = value.is_null() || value.as_object().is_some_and(Map::is_empty);
    let Some((last, parents)) = segs.split_last() else {
        *root = if deleting {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    };

    if deleting {
        remove_at(root, parents, last);
        return;
    }

    let mut node = root;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

/// Remove `key` under `parents`; returns true when the parent object became
/// empty so the caller can prune it.
fn remove_at(node: &mut Value, parents: &[String], key: &str) -> bool {
    let Value::Object(map) = node else {
        return false;
    };
    match parents.split_first() {
        None => {
            map.remove(key);
        }
        Some((head, rest)) => {
            let emptied = map
                .get_mut(head)
                .is_some_and(|child| remove_at(child, rest, key));
            if emptied {
                map.remove(head);
            }
        }
    }
    map.is_empty()
}

fn notify(inner: &mut Inner) {
    let Inner {
        root, subscribers, ..
    } = inner;
    subscribers.retain_mut(|sub| {
        if sub.tx.is_closed() {
            return false;
        }
        let segs: Vec<String> = sub.path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect();
        let children = lookup(root, &segs).and_then(Value::as_object);
        let Some(children) = children else {
            sub.seen.clear();
            return true;
        };

        let mut keys: Vec<&String> = children.keys().collect();
        keys.sort();
        for key in keys {
            if sub.seen.contains(key) {
                continue;
            }
            sub.seen.insert(key.clone());
            let child = Child {
                key: key.clone(),
                path: child_path(&sub.path, key),
                value: children[key].clone(),
            };
            if sub.tx.send(child).is_err() {
                return false;
            }
        }
        sub.seen.retain(|k| children.contains_key(k));
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn next(sub: &mut Subscription) -> Child {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out waiting for child")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn subscribe_delivers_existing_then_new_in_order() {
        let store = MemoryStore::new();
        store.push("q", json!(1)).await.unwrap();
        store.push("q", json!(2)).await.unwrap();

        let mut sub = store.subscribe("q").await.unwrap();
        assert_eq!(next(&mut sub).await.value, json!(1));
        assert_eq!(next(&mut sub).await.value, json!(2));

        store.push("q", json!(3)).await.unwrap();
        let third = next(&mut sub).await;
        assert_eq!(third.value, json!(3));
        assert!(third.path.starts_with("q/"));
    }

    #[tokio::test]
    async fn removed_children_are_not_redelivered() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("q").await.unwrap();
        store.push("q", json!("a")).await.unwrap();
        let a = next(&mut sub).await;
        store.remove(&a.path).await.unwrap();
        store.push("q", json!("b")).await.unwrap();
        assert_eq!(next(&mut sub).await.value, json!("b"));
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_prunes_empty_parents() {
        let store = MemoryStore::new();
        let key = store.push("sessions/s1/ssh/input", json!({"data": "eA=="})).await.unwrap();
        store.set("sessions/s1/ssh/state", json!({"status": "connected"})).await.unwrap();
        store
            .remove(&format!("sessions/s1/ssh/input/{key}"))
            .await
            .unwrap();
        assert!(store.get("sessions/s1/ssh/input").await.unwrap().is_none());
        assert!(store.get("sessions/s1/ssh/state").await.unwrap().is_some());
        // Removing again is fine.
        store.remove("sessions/s1/ssh/input").await.unwrap();
    }

    #[tokio::test]
    async fn update_merges_nested_fields() {
        let store = MemoryStore::new();
        store.set("servers/a", json!({"status": "online", "pid": 7})).await.unwrap();
        let mut fields = Map::new();
        fields.insert("status".into(), json!("shutting_down"));
        fields.insert("meta/note".into(), json!("bye"));
        store.update("servers/a", fields).await.unwrap();
        assert_eq!(
            store.get("servers/a").await.unwrap().unwrap(),
            json!({"status": "shutting_down", "pid": 7, "meta": {"note": "bye"}})
        );
    }

    #[tokio::test]
    async fn dropped_subscription_is_detached() {
        let store = MemoryStore::new();
        let sub = store.subscribe("x/y").await.unwrap();
        assert_eq!(store.subscriber_count("x/y"), 1);
        drop(sub);
        assert_eq!(store.subscriber_count("x/y"), 0);
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set("a/b.c", json!(1)).await,
            Err(StoreError::InvalidPath(_))
        ));
    }
}
