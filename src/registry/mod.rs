//! Server registry: `servers/{serverId}` records and their liveness.
//!
//! Each node writes exactly one record, its own. Readers never trust
//! `status` alone: a record whose heartbeat is older than the stale
//! threshold is reported as [`Liveness::Stale`], which is how abnormal exits
//! (no chance to deregister) become visible.

pub mod command;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{SharedStore, Store};
use crate::util::{hostname, now_ms, primary_ip};

pub const SERVERS: &str = "servers";

pub fn server_path(server_id: &str) -> String {
    format!("{SERVERS}/{server_id}")
}

/// What a registered process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Command listener only.
    Serve,
    /// Command listener plus the management endpoint.
    Manage,
    /// Dedicated shell server for one session.
    Ssh,
    /// Dedicated HTTP server for one session.
    Http,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serve => "serve",
            Self::Manage => "manage",
            Self::Ssh => "ssh",
            Self::Http => "http",
        }
    }
}

impl ServerRole {
    /// Registry id of a node of this role, from the node's base id.
    ///
    /// Dedicated `ssh`/`http` nodes get `{base}-{role}-{sessionId}`, so they
    /// never share a record or a command queue with a `serve`/`manage` node
    /// running on the same host.
    pub fn server_id(self, base: &str, session_id: Option<&str>) -> String {
        match (self, session_id) {
            (Self::Ssh | Self::Http, Some(session)) => format!("{base}-{self}-{session}"),
            _ => base.to_string(),
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    ShuttingDown,
    Exited,
}

impl ServerStatus {
    pub fn can_transition(self, to: ServerStatus) -> bool {
        matches!(
            (self, to),
            (Self::Online, Self::Online | Self::ShuttingDown | Self::Exited)
                | (Self::ShuttingDown, Self::Exited)
        )
    }
}

/// The record stored at `servers/{serverId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub server_id: String,
    #[serde(rename = "type")]
    pub role: ServerRole,
    pub host: String,
    pub ip: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: ServerStatus,
    pub started_at: u64,
    pub last_heartbeat: u64,
}

impl ServerRecord {
    /// A fresh `online` record for this process.
    pub fn local(
        server_id: &str,
        role: ServerRole,
        port: Option<u16>,
        session_id: Option<&str>,
    ) -> Self {
        let now = now_ms();
        Self {
            server_id: server_id.to_string(),
            role,
            host: hostname(),
            ip: primary_ip(),
            pid: std::process::id(),
            port,
            session_id: session_id.map(str::to_string),
            status: ServerStatus::Online,
            started_at: now,
            last_heartbeat: now,
        }
    }
}

/// Reader-side view of a record's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Online,
    Stale,
    ShuttingDown,
    Exited,
    Unknown,
}

/// Classify a raw record (server or session `info`) by `status` and
/// heartbeat age.
pub fn classify(record: &Value, now: u64, stale_after_ms: u64) -> Liveness {
    let status = record.get("status").and_then(Value::as_str);
    let last = record.get("lastHeartbeat").and_then(Value::as_u64);
    match (status, last) {
        (Some("online"), Some(last)) if now.saturating_sub(last) <= stale_after_ms => {
            Liveness::Online
        }
        (Some("online"), _) => Liveness::Stale,
        (Some("shutting_down"), _) => Liveness::ShuttingDown,
        (Some(_), _) => Liveness::Exited,
        (None, _) => Liveness::Unknown,
    }
}

/// This process's registration. Heartbeats until [`Registration::deregister`]
/// or drop.
pub struct Registration {
    store: SharedStore,
    path: String,
    status: ServerStatus,
    heartbeat: Option<JoinHandle<()>>,
}

impl Registration {
    /// Write `record` (replacing whatever a previous run left) and start the
    /// heartbeat.
    pub async fn register(
        store: SharedStore,
        record: &ServerRecord,
        interval: Duration,
    ) -> Result<Self, StoreError> {
        let path = server_path(&record.server_id);
        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::Protocol(format!("server record encode: {e}")))?;
        store.set(&path, value).await?;
        info!(
            server_id = %record.server_id,
            role = %record.role,
            "Registered in server registry"
        );

        let hb_store = store.clone();
        let hb_path = path.clone();
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let mut fields = Map::new();
                fields.insert("lastHeartbeat".into(), json!(now_ms()));
                fields.insert("status".into(), json!(ServerStatus::Online));
                match hb_store.update(&hb_path, fields).await {
                    Ok(()) => debug!(path = %hb_path, "Heartbeat"),
                    Err(e) => warn!(path = %hb_path, "Heartbeat failed: {e}"),
                }
            }
        });

        Ok(Self {
            store,
            path,
            status: ServerStatus::Online,
            heartbeat: Some(heartbeat),
        })
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Orderly exit: mark `shutting_down`, then delete the record. A record
    /// that cannot be deleted is left marked `exited`.
    pub async fn deregister(mut self) -> Result<(), StoreError> {
        self.stop_heartbeat();
        self.mark(ServerStatus::ShuttingDown).await?;
        if let Err(e) = self.store.remove(&self.path).await {
            warn!(path = %self.path, "Failed to delete server record: {e}");
            self.mark(ServerStatus::Exited).await?;
            return Err(e);
        }
        info!(path = %self.path, "Deregistered from server registry");
        Ok(())
    }

    async fn mark(&mut self, to: ServerStatus) -> Result<(), StoreError> {
        if !self.status.can_transition(to) {
            warn!(path = %self.path, from = ?self.status, to = ?to, "Rejected server status transition");
            return Ok(());
        }
        let mut fields = Map::new();
        fields.insert("status".into(), json!(to));
        self.store.update(&self.path, fields).await?;
        self.status = to;
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::command::{self, Action, CommandInbox};
    use crate::sessions::Feature;
    use crate::store::{MemoryStore, Subscription};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[test]
    fn staleness_is_inferred_from_heartbeat_age() {
        let now = 1_000_000;
        let fresh = json!({"status": "online", "lastHeartbeat": now - 10_000});
        let old = json!({"status": "online", "lastHeartbeat": now - 60_000});
        assert_eq!(classify(&fresh, now, 45_000), Liveness::Online);
        assert_eq!(classify(&old, now, 45_000), Liveness::Stale);
        assert_eq!(classify(&json!({"status": "online"}), now, 45_000), Liveness::Stale);
        assert_eq!(
            classify(&json!({"status": "shutting_down", "lastHeartbeat": now}), now, 45_000),
            Liveness::ShuttingDown
        );
        assert_eq!(classify(&json!({"status": "exited"}), now, 45_000), Liveness::Exited);
        assert_eq!(classify(&json!({}), now, 45_000), Liveness::Unknown);
    }

    #[test]
    fn server_status_transitions() {
        use ServerStatus::*;
        assert!(Online.can_transition(ShuttingDown));
        assert!(ShuttingDown.can_transition(Exited));
        assert!(!ShuttingDown.can_transition(Online));
        assert!(!Exited.can_transition(Online));
    }

    #[test]
    fn record_uses_wire_field_names() {
        let rec = ServerRecord::local("node-1", ServerRole::Http, Some(8080), Some("s1"));
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "http");
        assert_eq!(v["serverId"], "node-1");
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["port"], 8080);
        assert_eq!(v["status"], "online");
        assert!(v["lastHeartbeat"].as_u64().is_some());
        let back: ServerRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[tokio::test]
    async fn register_heartbeat_and_deregister() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut rec = ServerRecord::local("node-1", ServerRole::Serve, None, None);
        rec.last_heartbeat = 1;
        let reg = Registration::register(store.clone(), &rec, Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        let v = store.get("servers/node-1").await.unwrap().unwrap();
        assert!(v["lastHeartbeat"].as_u64().unwrap() > 1);
        assert_eq!(reg.status(), ServerStatus::Online);

        reg.deregister().await.unwrap();
        assert!(store.get("servers/node-1").await.unwrap().is_none());
    }

    #[test]
    fn dedicated_roles_get_their_own_ids() {
        assert_eq!(ServerRole::Serve.server_id("vm", None), "vm");
        assert_eq!(ServerRole::Manage.server_id("vm", None), "vm");
        assert_eq!(ServerRole::Ssh.server_id("vm", Some("s1")), "vm-ssh-s1");
        assert_eq!(ServerRole::Http.server_id("vm", Some("s1")), "vm-http-s1");
        let instance = crate::sessions::instance_id("vm-ssh-s1", Feature::Ssh, "s1");
        assert_eq!(
            crate::sessions::parse_instance_id(&instance),
            Some(("vm-ssh-s1".to_string(), Feature::Ssh, "s1".to_string()))
        );
    }

    #[tokio::test]
    async fn manage_and_ssh_nodes_on_one_host_stay_apart() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let manage_id = ServerRole::Manage.server_id("vm", None);
        let ssh_id = ServerRole::Ssh.server_id("vm", Some("s1"));
        assert_ne!(manage_id, ssh_id);

        let interval = Duration::from_secs(30);
        let manage_rec = ServerRecord::local(&manage_id, ServerRole::Manage, Some(55777), None);
        let manage_reg = Registration::register(store.clone(), &manage_rec, interval)
            .await
            .unwrap();
        let ssh_rec = ServerRecord::local(&ssh_id, ServerRole::Ssh, None, Some("s1"));
        let ssh_reg = Registration::register(store.clone(), &ssh_rec, interval)
            .await
            .unwrap();

        let manage_path = server_path(&manage_id);
        let v = store.get(&manage_path).await.unwrap().unwrap();
        assert_eq!(v["type"], "manage");

        let mut manage_inbox = CommandInbox::listen(store.clone(), &manage_id).await.unwrap();
        let mut ssh_inbox = CommandInbox::listen(store.clone(), &ssh_id).await.unwrap();
        command::send(&*store, &manage_id, Action::start(Feature::Ssh, "s2", None))
            .await
            .unwrap();
        let cmd = tokio::time::timeout(Duration::from_secs(2), manage_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd.action, Action::start(Feature::Ssh, "s2", None));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), ssh_inbox.recv())
                .await
                .is_err()
        );

        ssh_reg.deregister().await.unwrap();
        let v = store.get(&manage_path).await.unwrap().unwrap();
        assert_eq!(v["type"], "manage");
        assert!(store.get(&server_path(&ssh_id)).await.unwrap().is_none());
        manage_reg.deregister().await.unwrap();
    }

    /// Accepts every write except deletes.
    struct NoDelete(MemoryStore);

    #[async_trait]
    impl Store for NoDelete {
        async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
            self.0.push(path, value).await
        }
        async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
            self.0.set(path, value).await
        }
        async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
            self.0.update(path, fields).await
        }
        async fn remove(&self, _path: &str) -> Result<(), StoreError> {
            Err(StoreError::Status {
                status: 401,
                body: "Permission denied".into(),
            })
        }
        async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
            self.0.get(path).await
        }
        async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
            self.0.subscribe(path).await
        }
    }

    #[tokio::test]
    async fn undeletable_record_is_left_exited() {
        let store: SharedStore = Arc::new(NoDelete(MemoryStore::new()));
        let rec = ServerRecord::local("node-1", ServerRole::Serve, None, None);
        let reg = Registration::register(store.clone(), &rec, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(reg.deregister().await.is_err());
        let v = store.get("servers/node-1").await.unwrap().unwrap();
        assert_eq!(v["status"], "exited");
        assert_eq!(classify(&v, now_ms(), 45_000), Liveness::Exited);
    }
}
