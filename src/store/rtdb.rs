//! Realtime Database backend over REST + server-sent events.
//!
//! Writes map onto plain HTTP verbs against `{url}/{path}.json`:
//!
//! | Store op  | Request                                   |
//! |-----------|-------------------------------------------|
//! | `push`    | `POST`, response `{"name": "<push id>"}`  |
//! | `set`     | `PUT`                                     |
//! | `update`  | `PATCH`                                   |
//! | `remove`  | `DELETE`                                  |
//! | `get`     | `GET` (`null` means absent)               |
//!
//! Subscriptions open `GET` with `Accept: text/event-stream`. The database
//! replies with `put`/`patch` events carrying `{"path", "data"}` relative to
//! the subscribed node. A per-subscription set of known child keys turns those
//! into "child added" notifications, so a reconnect (which replays the full
//! snapshot) never delivers the same child twice.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{child_path, segments, Child, Store, Subscription};
use crate::config::StoreConfig;
use crate::error::StoreError;

#[derive(Clone)]
pub struct RtdbStore {
    http: reqwest::Client,
    /// Streaming requests must not carry the overall request timeout.
    stream_http: reqwest::Client,
    base_url: String,
    auth: Option<String>,
    reconnect_delay: Duration,
    reconnect_max_delay: Duration,
}

impl RtdbStore {
    pub fn new(config: &StoreConfig, url: &str) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            stream_http,
            base_url: url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs.max(1)),
            reconnect_max_delay: Duration::from_secs(config.reconnect_max_delay_secs.max(1)),
        })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, StoreError> {
        let segs = segments(path)?;
        let mut url = reqwest::Url::parse(&format!("{}/{}.json", self.base_url, segs.join("/")))
            .map_err(|e| StoreError::Protocol(format!("bad store URL: {e}")))?;
        if let Some(auth) = &self.auth {
            url.query_pairs_mut().append_pair("auth", auth);
        }
        Ok(url)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

#[async_trait]
impl Store for RtdbStore {
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let resp = self.http.post(self.url(path)?).json(&value).send().await?;
        let pushed: PushResponse = Self::check(resp).await?.json().await?;
        Ok(pushed.name)
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let resp = self.http.put(self.url(path)?).json(&value).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let resp = self.http.patch(self.url(path)?).json(&fields).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let resp = self.http.delete(self.url(path)?).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let resp = self.http.get(self.url(path)?).send().await?;
        let value: Value = Self::check(resp).await?.json().await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        // Validate eagerly so callers see path errors synchronously.
        self.url(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let listener = Listener {
            store: self.clone(),
            path: path.trim_matches('/').to_string(),
            known: HashSet::new(),
            tx,
        };
        tokio::spawn(listener.run(cancel.clone()));
        Ok(Subscription::new(rx, Some(cancel.drop_guard())))
    }
}

// ─── Event-stream listener ─────────────────────────────────────────

/// Reason a single event-stream connection ended.
enum StreamEnd {
    /// The database asked us to re-authenticate; reconnect right away.
    AuthRevoked,
    /// EOF from the server.
    Eof,
}

struct Listener {
    store: RtdbStore,
    path: String,
    known: HashSet<String>,
    tx: mpsc::UnboundedSender<Child>,
}

impl Listener {
    /// Connect, translate events, reconnect with backoff until cancelled or the
    /// subscriber goes away.
    async fn run(mut self, cancel: CancellationToken) {
        let mut delay = self.store.reconnect_delay;
        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return,
                r = self.connect_and_listen() => r,
            };
            if self.tx.is_closed() {
                return;
            }
            match outcome {
                Ok(StreamEnd::AuthRevoked) => {
                    info!(path = %self.path, "Store: auth revoked, reconnecting");
                    delay = self.store.reconnect_delay;
                    continue;
                }
                Ok(StreamEnd::Eof) => {
                    debug!(path = %self.path, "Store: event stream closed, reconnecting");
                    delay = self.store.reconnect_delay;
                }
                Err(e) => {
                    warn!(
                        path = %self.path,
                        "Store: event stream error: {e}, reconnecting in {}s",
                        delay.as_secs()
                    );
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.store.reconnect_max_delay);
        }
    }

    async fn connect_and_listen(&mut self) -> Result<StreamEnd, StoreError> {
        let resp = self
            .store
            .stream_http
            .get(self.store.url(&self.path)?)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = RtdbStore::check(resp).await?;
        let mut body = resp.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in parser.feed(&chunk) {
                match event.event.as_str() {
                    "put" | "patch" => {
                        let payload: EventPayload = serde_json::from_str(&event.data)
                            .map_err(|e| StoreError::Protocol(format!("bad event data: {e}")))?;
                        self.apply(event.event == "patch", payload).await?;
                        if self.tx.is_closed() {
                            return Ok(StreamEnd::Eof);
                        }
                    }
                    "keep-alive" => {}
                    "auth_revoked" => return Ok(StreamEnd::AuthRevoked),
                    "cancel" => {
                        return Err(StoreError::Protocol(format!(
                            "listener cancelled by store: {}",
                            event.data
                        )))
                    }
                    other => debug!(event = other, "Store: ignoring event"),
                }
            }
        }
        Ok(StreamEnd::Eof)
    }

    /// Translate one `put`/`patch` into child-added notifications.
    async fn apply(&mut self, patch: bool, payload: EventPayload) -> Result<(), StoreError> {
        let rel = payload.path.trim_matches('/');
        let (key, deeper) = match rel.split_once('/') {
            Some((k, _)) => (k, true),
            None => (rel, false),
        };

        if key.is_empty() {
            // Whole-node write: snapshot on `put`, multi-child merge on `patch`.
            let Value::Object(children) = payload.data else {
                if !patch {
                    self.known.clear();
                }
                return Ok(());
            };
            let mut keys: Vec<&String> = children.keys().collect();
            keys.sort();
            for key in keys {
                let value = &children[key];
                if value.is_null() {
                    self.known.remove(key);
                } else {
                    self.emit(key, value.clone());
                }
            }
            if !patch {
                self.known.retain(|k| children.contains_key(k));
            }
            return Ok(());
        }

        if !deeper && !patch {
            if payload.data.is_null() {
                self.known.remove(key);
            } else {
                self.emit(key, payload.data);
            }
            return Ok(());
        }

        // A write below a child: only interesting if the child is new to us,
        // and then we need its full value.
        if !self.known.contains(key) && !payload.data.is_null() {
            let full = child_path(&self.path, key);
            if let Some(value) = self.store.get(&full).await? {
                self.emit(key, value);
            }
        }
        Ok(())
    }

    fn emit(&mut self, key: &str, value: Value) {
        if !self.known.insert(key.to_string()) {
            return;
        }
        let _ = self.tx.send(Child {
            key: key.to_string(),
            path: child_path(&self.path, key),
            value,
        });
    }
}

#[derive(Deserialize)]
struct EventPayload {
    path: String,
    #[serde(default)]
    data: Value,
}

// ─── SSE framing ───────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Bytes may arrive split anywhere (mid-line, mid-UTF-8 sequence); complete
/// events are returned as soon as their terminating blank line is seen.
#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if let Some(ev) = self.dispatch() {
                    out.push(ev);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (&*line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: put\ndata: {\"pa").is_empty());
        let events = parser.feed(b"th\":\"/\",\"data\":null}\n\nevent: keep-alive\r\ndata: null\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "put".into(),
                    data: r#"{"path":"/","data":null}"#.into()
                },
                SseEvent {
                    event: "keep-alive".into(),
                    data: "null".into()
                },
            ]
        );
    }

    #[test]
    fn sse_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::default();
        let events = parser.feed(b": hello\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "a\nb");
    }

    fn listener() -> (Listener, mpsc::UnboundedReceiver<Child>) {
        let store = RtdbStore::new(&StoreConfig::default(), "http://127.0.0.1:9").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Listener {
                store,
                path: "sessions/s/ssh/input".into(),
                known: HashSet::new(),
                tx,
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Child>) -> Vec<String> {
        let mut keys = Vec::new();
        while let Ok(child) = rx.try_recv() {
            keys.push(child.key);
        }
        keys
    }

    #[tokio::test]
    async fn snapshot_and_child_puts_emit_each_key_once() {
        let (mut l, mut rx) = listener();
        l.apply(
            false,
            EventPayload {
                path: "/".into(),
                data: json!({"-b": {"data": "Yg=="}, "-a": {"data": "YQ=="}}),
            },
        )
        .await
        .unwrap();
        assert_eq!(drain(&mut rx), vec!["-a", "-b"]);

        // Replayed snapshot after reconnect: nothing new.
        l.apply(false, EventPayload { path: "/".into(), data: json!({"-b": {"data": "Yg=="}}) })
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        // Deletion then a fresh child.
        l.apply(false, EventPayload { path: "/-b".into(), data: Value::Null })
            .await
            .unwrap();
        l.apply(false, EventPayload { path: "/-c".into(), data: json!({"data": "Yw=="}) })
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec!["-c"]);
    }

    #[tokio::test]
    async fn root_patch_adds_new_children() {
        let (mut l, mut rx) = listener();
        l.apply(true, EventPayload { path: "/".into(), data: json!({"x": 1, "y": 2}) })
            .await
            .unwrap();
        l.apply(true, EventPayload { path: "/".into(), data: json!({"x": 3}) })
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec!["x", "y"]);
    }

    #[test]
    fn url_includes_auth_query() {
        let config = StoreConfig {
            auth: Some("tok".into()),
            ..StoreConfig::default()
        };
        let store = RtdbStore::new(&config, "https://db.example.com/").unwrap();
        let url = store.url("servers/a").unwrap();
        assert_eq!(url.as_str(), "https://db.example.com/servers/a.json?auth=tok");
    }
}
