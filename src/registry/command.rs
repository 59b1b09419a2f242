//! Control commands: `commands/{serverId}`.
//!
//! Anyone may append a command for a server; only that server reads its own
//! sub-path. A command is deleted the moment it is taken off the
//! subscription, before it is acted on, so a restart never replays it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::StoreError;
use crate::sessions::Feature;
use crate::store::{SharedStore, Store};
use crate::util::now_ms;

pub const COMMANDS: &str = "commands";

pub fn command_path(server_id: &str) -> String {
    format!("{COMMANDS}/{server_id}")
}

/// What a command asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    /// Stop every instance of `sessionId`, or the whole node without one.
    #[serde(rename = "stop")]
    Stop {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename = "startSSH")]
    StartSsh {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "stopSSH")]
    StopSsh {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "startHTTP")]
    StartHttp {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    #[serde(rename = "stopHTTP")]
    StopHttp {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl Action {
    pub fn start(feature: Feature, session_id: &str, port: Option<u16>) -> Self {
        let session_id = session_id.to_string();
        match feature {
            Feature::Ssh => Self::StartSsh { session_id },
            Feature::Http => Self::StartHttp { session_id, port },
        }
    }

    pub fn stop(feature: Feature, session_id: &str) -> Self {
        let session_id = session_id.to_string();
        match feature {
            Feature::Ssh => Self::StopSsh { session_id },
            Feature::Http => Self::StopHttp { session_id },
        }
    }
}

/// A command message as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default)]
    pub timestamp: u64,
}

/// Append `action` to `server_id`'s command channel.
pub async fn send(store: &dyn Store, server_id: &str, action: Action) -> Result<String, StoreError> {
    let cmd = Command {
        action,
        timestamp: now_ms(),
    };
    let value = codec::encode(&cmd).map_err(|e| StoreError::Protocol(e.to_string()))?;
    let key = store.push(&command_path(server_id), value).await?;
    debug!(server_id, key = %key, action = ?cmd.action, "Command sent");
    Ok(key)
}

/// Commands addressed to this node, fed by a forwarding task.
pub struct CommandInbox {
    rx: mpsc::Receiver<Command>,
    task: JoinHandle<()>,
}

impl CommandInbox {
    /// Subscribe to `commands/{server_id}`. Each command is deleted, decoded
    /// and forwarded; malformed ones are deleted and dropped.
    pub async fn listen(store: SharedStore, server_id: &str) -> Result<Self, StoreError> {
        let mut sub = store.subscribe(&command_path(server_id)).await?;
        let (tx, rx) = mpsc::channel(32);
        let server_id = server_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(child) = sub.next().await {
                if let Err(e) = store.remove(&child.path).await {
                    warn!(path = %child.path, "Failed to delete consumed command: {e}");
                }
                match codec::decode::<Command>(child.value) {
                    Ok(cmd) => {
                        info!(server_id = %server_id, action = ?cmd.action, "Command received");
                        if tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(key = %child.key, "Ignoring malformed command: {e}"),
                }
            }
        });
        Ok(Self { rx, task })
    }

    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }
}

impl Drop for CommandInbox {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wire_format_matches_action_names() {
        let cmd = Command {
            action: Action::start(Feature::Http, "s1", Some(3000)),
            timestamp: 5,
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"action": "startHTTP", "sessionId": "s1", "port": 3000, "timestamp": 5})
        );

        let stop: Command = serde_json::from_value(json!({"action": "stop", "timestamp": 1})).unwrap();
        assert_eq!(stop.action, Action::Stop { session_id: None });

        let ssh: Command =
            serde_json::from_value(json!({"action": "stopSSH", "sessionId": "x"})).unwrap();
        assert_eq!(ssh.action, Action::stop(Feature::Ssh, "x"));

        assert!(serde_json::from_value::<Command>(json!({"action": "reboot"})).is_err());
    }

    #[tokio::test]
    async fn commands_are_consumed_exactly_once() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        send(&*store, "node-a", Action::Stop { session_id: Some("s".into()) })
            .await
            .unwrap();
        store
            .push(&command_path("node-a"), json!({"action": "bogus"}))
            .await
            .unwrap();
        send(&*store, "node-b", Action::stop(Feature::Ssh, "other"))
            .await
            .unwrap();

        let mut inbox = CommandInbox::listen(store.clone(), "node-a").await.unwrap();
        let cmd = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd.action, Action::Stop { session_id: Some("s".into()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get(&command_path("node-a")).await.unwrap().is_none());

        // A second listener sees nothing left to replay.
        drop(inbox);
        let mut again = CommandInbox::listen(store.clone(), "node-a").await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), again.recv()).await.is_err());

        // Other servers' commands are untouched.
        assert!(store.get(&command_path("node-b")).await.unwrap().is_some());
    }
}
