//! Tunnels relayed through the store.
//!
//! Both tunnels run as a pair of peers that never talk directly:
//!
//! | Side   | Shell                           | HTTP                               |
//! |--------|---------------------------------|------------------------------------|
//! | server | [`shell_server`]: PTY ↔ mailboxes | [`http_server`]: mailboxes → local HTTP |
//! | client | [`shell_client`]: terminal ↔ mailboxes | [`http_client`]: local proxy → mailboxes |
//!
//! Every mailbox message is consumed exactly once: the reader deletes it as
//! soon as it has been taken off the subscription.

pub mod http_client;
pub mod http_server;
pub mod pending;
pub mod shell_client;
pub mod shell_server;

use std::sync::{Arc, OnceLock};

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::sessions::{InfoStatus, SessionStatus};
use crate::store::SharedStore;

/// Why a feature instance is being told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A `stop*` command addressed this instance.
    Command,
    /// The hosting node is shutting down.
    Shutdown,
}

impl StopReason {
    /// Terminal session status recorded for this reason.
    pub fn status(self) -> SessionStatus {
        match self {
            StopReason::Command => SessionStatus::Stopped,
            StopReason::Shutdown => SessionStatus::Disconnected,
        }
    }
}

/// One-shot stop request shared between the controller and a worker.
///
/// The first reason wins; later calls only re-cancel.
#[derive(Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once [`StopSignal::stop`] has been called.
    pub async fn stopped(&self) -> StopReason {
        self.token.cancelled().await;
        self.reason.get().copied().unwrap_or(StopReason::Command)
    }
}

/// Everything a server-side worker needs to run one feature instance.
#[derive(Clone)]
pub struct Worker {
    pub store: SharedStore,
    pub config: Arc<Config>,
    pub server_id: String,
    pub session_id: String,
    pub instance_id: String,
    /// Target port (http only).
    pub port: Option<u16>,
    pub stop: StopSignal,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn exited(code: i32) -> Self {
        Self {
            status: SessionStatus::Exited,
            exit_code: Some(code),
            error: None,
        }
    }

    pub fn stopped(reason: StopReason) -> Self {
        Self {
            status: reason.status(),
            exit_code: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Error,
            exit_code: None,
            error: Some(error.into()),
        }
    }

    pub fn info_status(&self) -> InfoStatus {
        self.status.into()
    }

    /// Fields merged into both `state` and `info` when the worker ends.
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(code) = self.exit_code {
            fields.insert("exitCode".into(), json!(code));
        }
        if let Some(error) = &self.error {
            fields.insert("error".into(), json!(error));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_stop_reason_wins() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        stop.stop(StopReason::Shutdown);
        stop.stop(StopReason::Command);
        assert_eq!(stop.stopped().await, StopReason::Shutdown);
    }

    #[test]
    fn exit_fields_carry_code_and_error() {
        assert_eq!(WorkerExit::exited(2).fields()["exitCode"], json!(2));
        let failed = WorkerExit::failed("boom");
        assert_eq!(failed.status, SessionStatus::Error);
        assert_eq!(failed.fields()["error"], json!("boom"));
        assert!(WorkerExit::stopped(StopReason::Command).fields().is_empty());
    }
}
