//! Feature-instance controller.
//!
//! The controller owns the table of feature instances running on this node.
//! Every start, stop and exit goes through its methods; nothing else touches
//! the table. Commands arrive from a [`CommandInbox`] forwarding task and
//! instance exits arrive on an mpsc channel, both consumed by [`Controller::run`].
//!
//! Each instance runs as its own tokio task, itself wrapped by a supervising
//! task, so a panic inside a worker is turned into an `error` exit instead of
//! taking the node down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::ControllerError;
use crate::registry::command::{Action, CommandInbox};
use crate::sessions::{self, Feature, InfoStatus, SessionPaths, SessionStatus};
use crate::state::{EventLog, EventType};
use crate::store::{SharedStore, Store};
use crate::tunnel::{http_server, shell_server, StopReason, StopSignal, Worker, WorkerExit};
use crate::util::now_ms;

/// How long shutdown waits for instances to write their final state.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Started {
    /// A new instance was spawned.
    Spawned(String),
    /// This node already runs that instance; nothing was spawned.
    AlreadyRunning(String),
}

impl Started {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Spawned(id) | Self::AlreadyRunning(id) => id,
        }
    }
}

struct Instance {
    generation: u64,
    stop: StopSignal,
}

/// Reported by an instance's supervising task when it ends.
#[derive(Debug)]
struct InstanceExit {
    instance_id: String,
    generation: u64,
    exit: WorkerExit,
}

pub struct Controller {
    store: SharedStore,
    config: Arc<Config>,
    server_id: String,
    events: Arc<EventLog>,
    instances: HashMap<String, Instance>,
    next_generation: u64,
    exits_tx: mpsc::UnboundedSender<InstanceExit>,
    exits_rx: mpsc::UnboundedReceiver<InstanceExit>,
}

impl Controller {
    pub fn new(
        store: SharedStore,
        config: Arc<Config>,
        server_id: &str,
        events: Arc<EventLog>,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            server_id: server_id.to_string(),
            events,
            instances: HashMap::new(),
            next_generation: 0,
            exits_tx,
            exits_rx,
        }
    }

    /// Ids of the instances currently running here.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start `feature` for `session_id`.
    ///
    /// Starting an instance this node already runs is a no-op. Starting one
    /// whose `info` shows another live owner fails with
    /// [`ControllerError::AlreadyRunning`].
    pub async fn start(
        &mut self,
        feature: Feature,
        session_id: &str,
        port: Option<u16>,
    ) -> Result<Started, ControllerError> {
        let instance_id = sessions::instance_id(&self.server_id, feature, session_id);
        if self.instances.contains_key(&instance_id) {
            info!(instance = %instance_id, "Start ignored: already running here");
            return Ok(Started::AlreadyRunning(instance_id));
        }

        let paths = SessionPaths::new(session_id, feature);
        if let Some(info) = self.store.get(&paths.info()).await? {
            let owner = info.get("instanceId").and_then(|v| v.as_str());
            let stale_after = self.config.registry.stale_after_ms();
            if owner != Some(instance_id.as_str())
                && sessions::is_live_owner(&info, now_ms(), stale_after)
            {
                let owner = owner.unwrap_or("unknown").to_string();
                warn!(instance = %instance_id, owner = %owner, "Start rejected: session has a live owner");
                self.events
                    .push(EventType::Rejected, &instance_id, format!("owned by {owner}"))
                    .await;
                return Err(ControllerError::AlreadyRunning(owner));
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let stop = StopSignal::new();
        let worker = Worker {
            store: self.store.clone(),
            config: self.config.clone(),
            server_id: self.server_id.clone(),
            session_id: session_id.to_string(),
            instance_id: instance_id.clone(),
            port,
            stop: stop.clone(),
        };
        self.spawn(feature, worker, generation);
        self.instances
            .insert(instance_id.clone(), Instance { generation, stop });

        info!(instance = %instance_id, "Feature instance started");
        let detail = port.map_or_else(String::new, |p| format!("port {p}"));
        self.events.push(EventType::Started, &instance_id, detail).await;
        Ok(Started::Spawned(instance_id))
    }

    fn spawn(&self, feature: Feature, worker: Worker, generation: u64) {
        let instance_id = worker.instance_id.clone();
        let exits = self.exits_tx.clone();
        let span = info_span!("instance", instance = %instance_id);
        let store = self.store.clone();
        let session_id = worker.session_id.clone();

        tokio::spawn(
            async move {
                let inner = match feature {
                    Feature::Ssh => tokio::spawn(shell_server::run(worker).in_current_span()),
                    Feature::Http => tokio::spawn(http_server::run(worker).in_current_span()),
                };
                let exit = match inner.await {
                    Ok(exit) => exit,
                    Err(e) => {
                        let message = if e.is_panic() {
                            "feature instance panicked".to_string()
                        } else {
                            format!("feature instance aborted: {e}")
                        };
                        error!("{message}");
                        let paths = SessionPaths::new(&session_id, feature);
                        record_crash(&store, &paths, &message).await;
                        WorkerExit::failed(message)
                    }
                };
                let _ = exits.send(InstanceExit {
                    instance_id,
                    generation,
                    exit,
                });
            }
            .instrument(span),
        );
    }

    /// Ask one instance to stop.
    pub async fn stop(&mut self, instance_id: &str, reason: StopReason) -> Result<(), ControllerError> {
        let instance = self
            .instances
            .get(instance_id)
            .ok_or_else(|| ControllerError::NotRunning(instance_id.to_string()))?;
        instance.stop.stop(reason);
        info!(instance = %instance_id, ?reason, "Stop requested");
        self.events
            .push(EventType::StopRequested, instance_id, format!("{reason:?}").to_lowercase())
            .await;
        Ok(())
    }

    /// Stop every instance serving `session_id`; returns how many were asked.
    pub async fn stop_session(&mut self, session_id: &str, reason: StopReason) -> usize {
        let ids: Vec<String> = self
            .instances
            .keys()
            .filter(|id| {
                sessions::parse_instance_id(id).is_some_and(|(_, _, s)| s == session_id)
            })
            .cloned()
            .collect();
        for id in &ids {
            let _ = self.stop(id, reason).await;
        }
        ids.len()
    }

    pub async fn stop_all(&mut self, reason: StopReason) {
        for id in self.running() {
            let _ = self.stop(&id, reason).await;
        }
    }

    /// Apply one command. Returns `false` when the node itself should stop.
    pub async fn apply(&mut self, action: Action) -> bool {
        let result = match action {
            Action::Stop { session_id: None } => {
                info!(server_id = %self.server_id, "Stop command for this node");
                self.stop_all(StopReason::Command).await;
                return false;
            }
            Action::Stop {
                session_id: Some(session_id),
            } => {
                if self.stop_session(&session_id, StopReason::Command).await == 0 {
                    warn!(session_id = %session_id, "Stop command for a session not running here");
                }
                Ok(())
            }
            Action::StartSsh { session_id } => self.start(Feature::Ssh, &session_id, None).await.map(drop),
            Action::StartHttp { session_id, port } => {
                self.start(Feature::Http, &session_id, port).await.map(drop)
            }
            Action::StopSsh { session_id } => {
                let id = sessions::instance_id(&self.server_id, Feature::Ssh, &session_id);
                self.stop(&id, StopReason::Command).await
            }
            Action::StopHttp { session_id } => {
                let id = sessions::instance_id(&self.server_id, Feature::Http, &session_id);
                self.stop(&id, StopReason::Command).await
            }
        };
        if let Err(e) = result {
            warn!(server_id = %self.server_id, "Command failed: {e}");
        }
        true
    }

    async fn reap(&mut self, exit: InstanceExit) {
        // A newer instance under the same id is not affected by an old exit.
        let current = self
            .instances
            .get(&exit.instance_id)
            .is_some_and(|i| i.generation == exit.generation);
        if current {
            self.instances.remove(&exit.instance_id);
        }

        let status = exit.exit.status;
        let (event, detail) = match (&exit.exit.error, exit.exit.exit_code) {
            (Some(e), _) => (EventType::Failed, e.clone()),
            (None, Some(code)) => (EventType::Exited, format!("{status}, code {code}")),
            (None, None) => (EventType::Exited, status.to_string()),
        };
        info!(instance = %exit.instance_id, %status, "Feature instance ended");
        self.events.push(event, &exit.instance_id, detail).await;
    }

    /// Serve commands until `shutdown` fires, a node-level stop arrives, or
    /// (with `exit_when_idle`) the last instance ends. Running instances are
    /// stopped and drained before returning.
    pub async fn run(
        mut self,
        mut inbox: CommandInbox,
        shutdown: CancellationToken,
        exit_when_idle: bool,
    ) {
        if exit_when_idle && self.instances.is_empty() {
            return;
        }
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Controller shutting down");
                    self.stop_all(StopReason::Shutdown).await;
                    break;
                }
                cmd = inbox.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("Command channel closed");
                        self.stop_all(StopReason::Shutdown).await;
                        break;
                    };
                    if !self.apply(cmd.action).await {
                        break;
                    }
                }
                Some(exit) = self.exits_rx.recv() => {
                    self.reap(exit).await;
                    if exit_when_idle && self.instances.is_empty() {
                        break;
                    }
                }
            }
        }
        self.drain().await;
    }

    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.instances.is_empty() {
            match tokio::time::timeout_at(deadline, self.exits_rx.recv()).await {
                Ok(Some(exit)) => self.reap(exit).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = ?self.running(), "Instances did not stop in time");
                    break;
                }
            }
        }
    }
}

/// Best-effort terminal records for an instance that died without writing
/// its own.
async fn record_crash(store: &SharedStore, paths: &SessionPaths, message: &str) {
    let mut state = Map::new();
    state.insert("status".into(), json!(SessionStatus::Error));
    state.insert("error".into(), json!(message));
    state.insert("timestamp".into(), json!(now_ms()));
    if let Err(e) = store.update(&paths.state(), state).await {
        warn!("Failed to record crash in state: {e}");
    }
    let mut info = Map::new();
    info.insert("status".into(), json!(InfoStatus::Error));
    info.insert("error".into(), json!(message));
    info.insert("endedAt".into(), json!(now_ms()));
    if let Err(e) = store.update(&paths.info(), info).await {
        warn!("Failed to record crash in info: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::command;
    use crate::sessions::SessionState;
    use crate::store::MemoryStore;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.shell.default_shell = "/bin/sh".into();
        config.shell.login = false;
        config.shell.default_working_dir = "/".into();
        config.shell.term = "dumb".into();
        Arc::new(config)
    }

    async fn wait_for_status(store: &SharedStore, paths: &SessionPaths, want: SessionStatus) {
        for _ in 0..200 {
            let state = SessionState::from_value(store.get(&paths.state()).await.unwrap());
            if state.status == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("session never reached {want}");
    }

    #[tokio::test]
    async fn repeated_start_does_not_spawn_twice() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let events = Arc::new(EventLog::new());
        let mut ctl = Controller::new(store.clone(), test_config(), "node", events.clone());

        let first = ctl.start(Feature::Ssh, "dup", None).await.unwrap();
        assert_eq!(first, Started::Spawned("node_ssh_dup".into()));
        let second = ctl.start(Feature::Ssh, "dup", None).await.unwrap();
        assert_eq!(second, Started::AlreadyRunning("node_ssh_dup".into()));
        assert_eq!(ctl.running(), vec!["node_ssh_dup".to_string()]);

        ctl.stop_all(StopReason::Command).await;
        ctl.drain().await;
        assert!(ctl.running().is_empty());
    }

    #[tokio::test]
    async fn live_owner_elsewhere_rejects_start() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let paths = SessionPaths::new("taken", Feature::Http);
        store
            .set(
                &paths.info(),
                json!({"status": "online", "instanceId": "other_http_taken", "lastHeartbeat": now_ms()}),
            )
            .await
            .unwrap();
        let mut ctl = Controller::new(store.clone(), test_config(), "node", Arc::new(EventLog::new()));
        let err = ctl.start(Feature::Http, "taken", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Session already running");
        assert!(ctl.running().is_empty());

        // Once the owner's heartbeat is stale the session can be taken over.
        store
            .set(
                &paths.info(),
                json!({"status": "online", "instanceId": "other_http_taken", "lastHeartbeat": 1}),
            )
            .await
            .unwrap();
        assert!(matches!(
            ctl.start(Feature::Http, "taken", None).await.unwrap(),
            Started::Spawned(_)
        ));
        ctl.stop_all(StopReason::Command).await;
        ctl.drain().await;
    }

    #[tokio::test]
    async fn stop_command_is_consumed_once_and_instance_ends() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let events = Arc::new(EventLog::new());
        let mut ctl = Controller::new(store.clone(), test_config(), "node", events.clone());
        ctl.start(Feature::Ssh, "d", None).await.unwrap();

        let paths = SessionPaths::new("d", Feature::Ssh);
        wait_for_status(&store, &paths, SessionStatus::Connected).await;

        let inbox = CommandInbox::listen(store.clone(), "node").await.unwrap();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(ctl.run(inbox, shutdown.clone(), true));

        command::send(&*store, "node", Action::stop(Feature::Ssh, "d"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(store.get(&command::command_path("node")).await.unwrap().is_none());
        let state = SessionState::from_value(store.get(&paths.state()).await.unwrap());
        assert_eq!(state.status, Some(SessionStatus::Stopped));
        let info = store.get(&paths.info()).await.unwrap().unwrap();
        assert_eq!(info["status"], "stopped");

        let recent = events.recent().await;
        assert_eq!(recent[0]["event"], "exited");
        assert_eq!(recent[1]["event"], "stop_requested");
    }

    #[tokio::test]
    async fn shutdown_marks_shells_disconnected() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut ctl = Controller::new(store.clone(), test_config(), "node", Arc::new(EventLog::new()));
        ctl.start(Feature::Ssh, "sd", None).await.unwrap();
        let paths = SessionPaths::new("sd", Feature::Ssh);
        wait_for_status(&store, &paths, SessionStatus::Connected).await;

        let inbox = CommandInbox::listen(store.clone(), "node").await.unwrap();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(ctl.run(inbox, shutdown.clone(), false));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, &paths, SessionStatus::Disconnected).await;
    }

    #[tokio::test]
    async fn stopping_an_unknown_instance_reports_not_running() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut ctl = Controller::new(store, test_config(), "node", Arc::new(EventLog::new()));
        assert!(matches!(
            ctl.stop("node_ssh_nope", StopReason::Command).await,
            Err(ControllerError::NotRunning(_))
        ));
        assert!(ctl.apply(Action::Stop { session_id: Some("nope".into()) }).await);
        assert!(!ctl.apply(Action::Stop { session_id: None }).await);
    }
}
