//! Server side of the shell tunnel.
//!
//! Claims `sessions/{id}/ssh`, spawns a PTY shell sized from `state`, then
//! relays until the shell exits or the instance is stopped:
//!
//! - PTY output → one `output` message per read, in emission order
//! - `input` messages → deleted, decoded, written verbatim to the PTY
//! - `state/resize` → applied to the PTY, then deleted. A request may be
//!   overwritten before it is deleted, so the size in `state.cols`/`state.rows`
//!   (written alongside every request) is re-read and applied afterwards.

use std::time::Duration;

use serde_json::{json, Map};
use tracing::{debug, error, info, warn};

use super::{StopReason, Worker, WorkerExit};
use crate::codec::{self, Payload, ShellData};
use crate::host::SystemInfo;
use crate::sessions::{
    Feature, InfoPublisher, InfoStatus, Resize, SessionInfo, SessionPaths, SessionState,
    SessionStatus, StateWriter,
};
use crate::shell::{PtyShell, ShellSpec};
use crate::store::{Child, Store};
use crate::util::now_ms;

/// Output still buffered in the PTY after exit is flushed for at most this long.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

enum LoopEnd {
    Exited(i32),
    Stopped(StopReason),
    Failed(String),
}

/// Run one shell instance to completion.
pub async fn run(worker: Worker) -> WorkerExit {
    let store = worker.store.clone();
    let paths = SessionPaths::new(&worker.session_id, Feature::Ssh);

    let mut state = match StateWriter::open(store.clone(), &paths).await {
        Ok(s) => s,
        Err(e) => return WorkerExit::failed(format!("failed to read session state: {e}")),
    };

    let shell_cfg = &worker.config.shell;
    let current = SessionState::from_value(store.get(&paths.state()).await.ok().flatten());
    let cols = current.cols.filter(|c| *c > 0).unwrap_or(shell_cfg.default_cols);
    let rows = current.rows.filter(|r| *r > 0).unwrap_or(shell_cfg.default_rows);

    let mut shell = match PtyShell::spawn(&ShellSpec::from_config(shell_cfg, rows, cols)) {
        Ok(shell) => shell,
        Err(e) => {
            error!(session_id = %worker.session_id, "Failed to start shell: {e}");
            let exit = WorkerExit::failed(e.to_string());
            let _ = state.transition(SessionStatus::Error, exit.fields()).await;
            return exit;
        }
    };
    info!(session_id = %worker.session_id, pid = shell.pid, cols, rows, "Shell started");

    let now = now_ms();
    let session_info = SessionInfo {
        server: SystemInfo::collect(),
        server_id: worker.server_id.clone(),
        instance_id: worker.instance_id.clone(),
        pid: std::process::id(),
        port: None,
        status: InfoStatus::Online,
        started_at: now,
        last_heartbeat: now,
    };
    let publisher = match InfoPublisher::publish(
        store.clone(),
        &paths,
        &session_info,
        worker.config.registry.heartbeat_interval(),
    )
    .await
    {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(session_id = %worker.session_id, "Failed to publish session info: {e}");
            None
        }
    };

    let mut fields = Map::new();
    fields.insert("shellPid".into(), json!(shell.pid));
    if let Err(e) = state.transition(SessionStatus::Connected, fields).await {
        warn!(session_id = %worker.session_id, "Failed to mark session connected: {e}");
    }

    let end = relay(&worker, &paths, &mut shell).await;

    let exit = match end {
        LoopEnd::Exited(code) => {
            drain_output(&*store, &paths, &mut shell).await;
            info!(session_id = %worker.session_id, code, "Shell exited");
            WorkerExit::exited(code)
        }
        LoopEnd::Stopped(reason) => {
            info!(session_id = %worker.session_id, ?reason, "Stopping shell");
            shell.graceful_kill().await;
            WorkerExit::stopped(reason)
        }
        LoopEnd::Failed(msg) => {
            error!(session_id = %worker.session_id, "Shell tunnel failed: {msg}");
            shell.graceful_kill().await;
            WorkerExit::failed(msg)
        }
    };

    if let Err(e) = state.transition(exit.status, exit.fields()).await {
        warn!(session_id = %worker.session_id, "Failed to write final state: {e}");
    }
    if let Some(publisher) = publisher {
        if let Err(e) = publisher.finish(exit.info_status(), exit.fields()).await {
            warn!(session_id = %worker.session_id, "Failed to finish session info: {e}");
        }
    }
    exit
}

async fn relay(worker: &Worker, paths: &SessionPaths, shell: &mut PtyShell) -> LoopEnd {
    let store = &*worker.store;
    let mut input = match store.subscribe(&paths.input()).await {
        Ok(s) => s,
        Err(e) => return LoopEnd::Failed(format!("failed to subscribe to input: {e}")),
    };
    let mut state_sub = match store.subscribe(&paths.state()).await {
        Ok(s) => s,
        Err(e) => return LoopEnd::Failed(format!("failed to subscribe to state: {e}")),
    };
    let output_path = paths.output();
    let state_path = paths.state();
    let mut output_open = true;
    let mut applied: Option<Resize> = None;

    loop {
        tokio::select! {
            reason = worker.stop.stopped() => return LoopEnd::Stopped(reason),
            chunk = shell.output.recv(), if output_open => match chunk {
                Some(bytes) => push_output(store, &output_path, bytes).await,
                None => output_open = false,
            },
            msg = input.next() => {
                let Some(msg) = msg else {
                    return LoopEnd::Failed("input subscription closed".into());
                };
                if let Err(e) = consume_input(store, shell, msg).await {
                    return LoopEnd::Failed(e);
                }
            },
            child = state_sub.next() => {
                let Some(child) = child else {
                    return LoopEnd::Failed("state subscription closed".into());
                };
                if child.key == "resize" {
                    apply_resize(store, shell, &state_path, child, &mut applied).await;
                }
            },
            res = shell.exit.changed() => {
                let code = shell.exit_code();
                match (res, code) {
                    (_, Some(code)) => return LoopEnd::Exited(code),
                    (Err(_), None) => return LoopEnd::Exited(-1),
                    (Ok(()), None) => {}
                }
            },
        }
    }
}

async fn push_output(store: &dyn Store, output_path: &str, bytes: Vec<u8>) {
    let msg = ShellData {
        data: Payload(bytes),
    };
    match codec::encode(&msg) {
        Ok(value) => {
            if let Err(e) = store.push(output_path, value).await {
                warn!(path = output_path, "Failed to push shell output: {e}");
            }
        }
        Err(e) => warn!("Failed to encode shell output: {e}"),
    }
}

/// Delete one input message, then write its bytes to the PTY.
async fn consume_input(store: &dyn Store, shell: &PtyShell, msg: Child) -> Result<(), String> {
    if let Err(e) = store.remove(&msg.path).await {
        warn!(path = %msg.path, "Failed to delete consumed input: {e}");
    }
    match codec::decode::<ShellData>(msg.value) {
        Ok(data) => shell
            .write(data.data.into_bytes())
            .await
            .map_err(|e| e.to_string()),
        Err(e) => {
            warn!(key = %msg.key, "Dropping malformed shell input: {e}");
            Ok(())
        }
    }
}

async fn apply_resize(
    store: &dyn Store,
    shell: &PtyShell,
    state_path: &str,
    child: Child,
    applied: &mut Option<Resize>,
) {
    match serde_json::from_value::<Resize>(child.value) {
        Ok(size) => set_size(shell, size, applied),
        Err(e) => warn!("Ignoring malformed resize request: {e}"),
    }
    if let Err(e) = store.remove(&child.path).await {
        warn!(path = %child.path, "Failed to clear resize request: {e}");
    }
    match store.get(state_path).await {
        Ok(Some(state)) => {
            if let Ok(latest) = serde_json::from_value::<Resize>(state) {
                set_size(shell, latest, applied);
            }
        }
        Ok(None) => {}
        Err(e) => warn!(path = state_path, "Failed to re-read terminal size: {e}"),
    }
}

fn set_size(shell: &PtyShell, size: Resize, applied: &mut Option<Resize>) {
    if size.cols == 0 || size.rows == 0 || *applied == Some(size) {
        return;
    }
    match shell.resize(size.rows, size.cols) {
        Ok(()) => {
            *applied = Some(size);
            debug!(cols = size.cols, rows = size.rows, "PTY resized");
        }
        Err(e) => warn!("PTY resize failed: {e}"),
    }
}

/// Forward what the PTY still holds after the shell exited.
async fn drain_output(store: &dyn Store, paths: &SessionPaths, shell: &mut PtyShell) {
    let output_path = paths.output();
    while let Ok(Some(bytes)) = tokio::time::timeout(DRAIN_TIMEOUT, shell.output.recv()).await {
        push_output(store, &output_path, bytes).await;
    }
}
