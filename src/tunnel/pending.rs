//! Client-side table of requests awaiting their first response message.
//!
//! Each proxied request registers its `reqId` before the request message is
//! written; the output dispatcher resolves the entry when the matching
//! response arrives. The table is the only place that maps ids to waiters, and
//! every path out of a request (response, timeout, push failure) removes its
//! entry.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use crate::codec::HttpResponse;
use crate::util::{base36, now_ms};

#[derive(Default)]
pub struct PendingTable {
    waiters: Mutex<HashMap<String, oneshot::Sender<HttpResponse>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `req_id`.
    pub async fn register(&self, req_id: &str) -> oneshot::Receiver<HttpResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(req_id.to_string(), tx);
        rx
    }

    /// Hand a response to its waiter. Returns `false` for responses nobody is
    /// waiting for (timed out, or addressed to another client).
    pub async fn resolve(&self, resp: HttpResponse) -> bool {
        let waiter = self.waiters.lock().await.remove(&resp.req_id);
        match waiter {
            Some(tx) => tx.send(resp).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `req_id`, if any.
    pub async fn cancel(&self, req_id: &str) {
        self.waiters.lock().await.remove(req_id);
    }

    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.waiters.lock().await.is_empty()
    }
}

/// A fresh request id: base-36 millisecond timestamp plus random suffix.
pub fn new_req_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", base36(now_ms()), &random[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Headers, Payload};

    fn response(req_id: &str, status: u16) -> HttpResponse {
        HttpResponse {
            req_id: req_id.into(),
            kind: None,
            status,
            headers: Headers::new(),
            body: Payload::default(),
        }
    }

    #[tokio::test]
    async fn responses_reach_only_their_own_waiter() {
        let table = PendingTable::new();
        let a = table.register("a").await;
        let b = table.register("b").await;

        assert!(table.resolve(response("b", 201)).await);
        assert!(table.resolve(response("a", 200)).await);
        assert_eq!(a.await.unwrap().status, 200);
        assert_eq!(b.await.unwrap().status, 201);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn orphans_and_cancelled_requests_are_not_delivered() {
        let table = PendingTable::new();
        assert!(!table.resolve(response("ghost", 200)).await);

        let rx = table.register("late").await;
        table.cancel("late").await;
        assert!(!table.resolve(response("late", 200)).await);
        assert!(rx.await.is_err());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = new_req_id();
        let b = new_req_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
