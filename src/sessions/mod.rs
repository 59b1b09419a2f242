//! Session records in the store.
//!
//! A session is addressed by an opaque id chosen by the client. Each feature
//! (`ssh`, `http`) running for it owns a subtree:
//!
//! ```text
//! sessions/{sessionId}/{feature}/
//!     input/      client → server mailbox
//!     output/     server → client mailbox
//!     streams/    {reqId}_stream mailboxes (http only)
//!     state       status machine + terminal size
//!     info        host metadata, heartbeat, client info
//! ```
//!
//! At most one feature instance owns a subtree; its id is
//! `{serverId}_{feature}_{sessionId}` (see [`instance_id`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::host::SystemInfo;
use crate::store::{SharedStore, Store};
use crate::util::now_ms;

// ─── Features and paths ────────────────────────────────────────────

/// Root of the session tree.
pub const SESSIONS: &str = "sessions";

/// A tunnel kind that can run for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Ssh,
    Http,
}

impl Feature {
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Ssh => "ssh",
            Feature::Http => "http",
        }
    }

    pub const ALL: [Feature; 2] = [Feature::Ssh, Feature::Http];
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Feature::Ssh),
            "http" => Ok(Feature::Http),
            other => Err(format!("unknown feature '{other}'")),
        }
    }
}

/// Store paths of one `(session, feature)` subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    root: String,
}

impl SessionPaths {
    pub fn new(session_id: &str, feature: Feature) -> Self {
        Self {
            root: format!("{SESSIONS}/{session_id}/{feature}"),
        }
    }

    pub fn input(&self) -> String {
        format!("{}/input", self.root)
    }

    pub fn output(&self) -> String {
        format!("{}/output", self.root)
    }

    pub fn state(&self) -> String {
        format!("{}/state", self.root)
    }

    pub fn info(&self) -> String {
        format!("{}/info", self.root)
    }

    pub fn streams(&self) -> String {
        format!("{}/streams", self.root)
    }

    /// Mailbox carrying the streamed body of `req_id`.
    pub fn stream(&self, req_id: &str) -> String {
        format!("{}/streams/{}", self.root, crate::codec::stream_key(req_id))
    }
}

/// Identity of a feature instance: `{serverId}_{feature}_{sessionId}`.
pub fn instance_id(server_id: &str, feature: Feature, session_id: &str) -> String {
    format!("{server_id}_{feature}_{session_id}")
}

/// Split an instance id back into `(serverId, feature, sessionId)`.
///
/// The first `_ssh_` / `_http_` marker wins, so session ids may contain
/// underscores; server ids may not contain the markers themselves.
pub fn parse_instance_id(id: &str) -> Option<(String, Feature, String)> {
    let mut best: Option<(usize, Feature)> = None;
    for feature in Feature::ALL {
        let marker = format!("_{feature}_");
        if let Some(pos) = id.find(&marker) {
            if best.is_none_or(|(p, _)| pos < p) {
                best = Some((pos, feature));
            }
        }
    }
    let (pos, feature) = best?;
    let server = &id[..pos];
    let session = &id[pos + feature.as_str().len() + 2..];
    if server.is_empty() || session.is_empty() {
        return None;
    }
    Some((server.to_string(), feature, session.to_string()))
}

// ─── Status machine ────────────────────────────────────────────────

/// `state.status` of a session feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Client attached and waiting for a server.
    ClientConnected,
    /// A server instance has claimed the session.
    Connected,
    /// The shell exited on its own.
    Exited,
    /// The instance failed.
    Error,
    /// Stopped by command.
    Stopped,
    /// The serving node shut down.
    Disconnected,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Exited
                | SessionStatus::Error
                | SessionStatus::Stopped
                | SessionStatus::Disconnected
        )
    }

    /// Whether `from → to` is allowed. `None` is a fresh (or previously
    /// finished) record.
    pub fn can_transition(from: Option<SessionStatus>, to: SessionStatus) -> bool {
        use SessionStatus::{ClientConnected, Connected, Disconnected, Error, Exited, Stopped};
        match from {
            None => matches!(to, ClientConnected | Connected | Error | Stopped),
            Some(ClientConnected) => matches!(to, ClientConnected | Connected | Error | Stopped),
            Some(Connected) => matches!(to, Exited | Error | Stopped | Disconnected),
            Some(_) => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = serde_json::to_value(self).unwrap_or(Value::Null);
        f.write_str(v.as_str().unwrap_or("unknown"))
    }
}

/// The `state` record as read back from the store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<SessionStatus>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub timestamp: Option<u64>,
}

/// Unknown status strings read as "no status" instead of failing the record.
fn lenient_status<'de, D>(d: D) -> Result<Option<SessionStatus>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.and_then(|v| serde_json::from_value(v).ok()))
}

impl SessionState {
    pub fn from_value(value: Option<Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Terminal size request written by the client to `state/resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// Writes `state` on behalf of the single owner of a session feature,
/// rejecting transitions the status machine does not allow.
pub struct StateWriter {
    store: SharedStore,
    path: String,
    current: Option<SessionStatus>,
}

impl StateWriter {
    /// Open the record for a new owner. Only a waiting client carries over;
    /// anything else was left by a finished or dead instance and counts as
    /// fresh, so a session id can be reclaimed.
    pub async fn open(store: SharedStore, paths: &SessionPaths) -> Result<Self, StoreError> {
        let path = paths.state();
        let current = SessionState::from_value(store.get(&path).await?)
            .status
            .filter(|s| *s == SessionStatus::ClientConnected);
        Ok(Self {
            store,
            path,
            current,
        })
    }

    pub fn current(&self) -> Option<SessionStatus> {
        self.current
    }

    /// Move to `to`, merging `extra` fields into the record. Returns `false`
    /// (and writes nothing) when the transition is not allowed.
    pub async fn transition(
        &mut self,
        to: SessionStatus,
        extra: Map<String, Value>,
    ) -> Result<bool, StoreError> {
        if !SessionStatus::can_transition(self.current, to) {
            warn!(
                path = %self.path,
                from = ?self.current,
                to = %to,
                "Rejected invalid session state transition"
            );
            return Ok(false);
        }
        let mut fields = extra;
        fields.insert("status".into(), json!(to));
        fields.insert("timestamp".into(), json!(now_ms()));
        self.store.update(&self.path, fields).await?;
        debug!(path = %self.path, status = %to, "Session state updated");
        self.current = Some(to);
        Ok(true)
    }
}

/// Announce a client on `state`. When a server already holds the session the
/// status is left alone and only `extra` is merged; returns whether that was
/// the case.
pub async fn announce_client(
    store: &dyn Store,
    paths: &SessionPaths,
    extra: Map<String, Value>,
) -> Result<bool, StoreError> {
    let path = paths.state();
    let current = SessionState::from_value(store.get(&path).await?);
    if current.status == Some(SessionStatus::Connected) {
        if !extra.is_empty() {
            store.update(&path, extra).await?;
        }
        return Ok(true);
    }
    let mut record = extra;
    record.insert("status".into(), json!(SessionStatus::ClientConnected));
    record.insert("timestamp".into(), json!(now_ms()));
    store.set(&path, Value::Object(record)).await?;
    Ok(false)
}

// ─── Info + heartbeat ──────────────────────────────────────────────

/// `info.status` of a feature instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoStatus {
    Online,
    Exited,
    Stopped,
    Error,
    Disconnected,
}

impl From<SessionStatus> for InfoStatus {
    fn from(s: SessionStatus) -> Self {
        match s {
            SessionStatus::Exited => InfoStatus::Exited,
            SessionStatus::Error => InfoStatus::Error,
            SessionStatus::Stopped => InfoStatus::Stopped,
            SessionStatus::Disconnected => InfoStatus::Disconnected,
            SessionStatus::ClientConnected | SessionStatus::Connected => InfoStatus::Online,
        }
    }
}

/// The `info` record written when an instance claims a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub server: SystemInfo,
    pub server_id: String,
    pub instance_id: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: InfoStatus,
    pub started_at: u64,
    pub last_heartbeat: u64,
}

/// Whether an `info` record shows a live owner: `online` with a heartbeat no
/// older than `stale_after_ms`.
pub fn is_live_owner(info: &Value, now: u64, stale_after_ms: u64) -> bool {
    let online = info.get("status").and_then(Value::as_str) == Some("online");
    let last = info.get("lastHeartbeat").and_then(Value::as_u64).unwrap_or(0);
    online && now.saturating_sub(last) <= stale_after_ms
}

/// Publishes an instance's `info` record and keeps its heartbeat fresh.
pub struct InfoPublisher {
    store: SharedStore,
    path: String,
    heartbeat: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl InfoPublisher {
    /// Write `info` (replacing any previous instance's record) and start the
    /// heartbeat task.
    pub async fn publish(
        store: SharedStore,
        paths: &SessionPaths,
        info: &SessionInfo,
        interval: Duration,
    ) -> Result<Self, StoreError> {
        let path = paths.info();
        let value = serde_json::to_value(info)
            .map_err(|e| StoreError::Protocol(format!("info encode: {e}")))?;
        store.set(&path, value).await?;

        let cancel = CancellationToken::new();
        let hb_store = store.clone();
        let hb_path = path.clone();
        let hb_cancel = cancel.clone();
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    () = hb_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let mut fields = Map::new();
                        fields.insert("lastHeartbeat".into(), json!(now_ms()));
                        if let Err(e) = hb_store.update(&hb_path, fields).await {
                            warn!(path = %hb_path, "Session heartbeat failed: {e}");
                        }
                    }
                }
            }
        });

        Ok(Self {
            store,
            path,
            heartbeat: Some(heartbeat),
            cancel,
        })
    }

    /// Record `info/client` once.
    pub async fn record_client(&self, client: &crate::codec::ClientInfo) -> Result<(), StoreError> {
        let value = serde_json::to_value(client)
            .map_err(|e| StoreError::Protocol(format!("client info encode: {e}")))?;
        self.store.set(&format!("{}/client", self.path), value).await
    }

    /// Stop the heartbeat and record the final status plus `extra` fields.
    pub async fn finish(
        mut self,
        status: InfoStatus,
        extra: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.stop_heartbeat();
        let mut fields = extra;
        fields.insert("status".into(), json!(status));
        fields.insert("endedAt".into(), json!(now_ms()));
        self.store.update(&self.path, fields).await
    }

    fn stop_heartbeat(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl Drop for InfoPublisher {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn paths_follow_session_layout() {
        let p = SessionPaths::new("abc", Feature::Http);
        assert_eq!(p.input(), "sessions/abc/http/input");
        assert_eq!(p.state(), "sessions/abc/http/state");
        assert_eq!(p.stream("r1"), "sessions/abc/http/streams/r1_stream");
    }

    #[test]
    fn instance_ids_round_trip() {
        let id = instance_id("box-1", Feature::Ssh, "my_session");
        assert_eq!(id, "box-1_ssh_my_session");
        assert_eq!(
            parse_instance_id(&id),
            Some(("box-1".into(), Feature::Ssh, "my_session".into()))
        );
        assert_eq!(parse_instance_id("nofeature"), None);
        assert_eq!(parse_instance_id("_http_x"), None);
    }

    #[test]
    fn transition_table() {
        use SessionStatus::*;
        assert!(SessionStatus::can_transition(None, ClientConnected));
        assert!(SessionStatus::can_transition(Some(ClientConnected), Connected));
        assert!(SessionStatus::can_transition(Some(Connected), Exited));
        assert!(SessionStatus::can_transition(Some(Connected), Disconnected));
        assert!(!SessionStatus::can_transition(None, Exited));
        assert!(!SessionStatus::can_transition(Some(Exited), Connected));
        assert!(!SessionStatus::can_transition(Some(Stopped), Stopped));
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(json!(SessionStatus::ClientConnected), json!("client-connected"));
        assert_eq!(SessionStatus::Disconnected.to_string(), "disconnected");
        let s = SessionState::from_value(Some(json!({"status": "weird", "cols": 80})));
        assert_eq!(s.status, None);
        assert_eq!(s.cols, Some(80));
    }

    #[tokio::test]
    async fn state_writer_rejects_invalid_transitions() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let paths = SessionPaths::new("s", Feature::Ssh);
        store
            .set(&paths.state(), json!({"status": "client-connected", "cols": 120, "rows": 40}))
            .await
            .unwrap();

        let mut writer = StateWriter::open(store.clone(), &paths).await.unwrap();
        assert_eq!(writer.current(), Some(SessionStatus::ClientConnected));
        assert!(writer.transition(SessionStatus::Connected, Map::new()).await.unwrap());
        assert!(!writer
            .transition(SessionStatus::ClientConnected, Map::new())
            .await
            .unwrap());

        let state = SessionState::from_value(store.get(&paths.state()).await.unwrap());
        assert_eq!(state.status, Some(SessionStatus::Connected));
        assert_eq!(state.cols, Some(120));
    }

    #[test]
    fn live_owner_requires_fresh_online_heartbeat() {
        let now = 100_000;
        assert!(is_live_owner(&json!({"status": "online", "lastHeartbeat": 90_000}), now, 45_000));
        assert!(!is_live_owner(&json!({"status": "online", "lastHeartbeat": 10_000}), now, 45_000));
        assert!(!is_live_owner(&json!({"status": "exited", "lastHeartbeat": 99_000}), now, 45_000));
    }
}
