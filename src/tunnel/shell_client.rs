//! Client side of the shell tunnel.
//!
//! [`attach`] announces the client on `state`, then shuttles bytes:
//! local input → `input` messages, `output` messages → local output (each
//! deleted once written). It ends when the local input closes, the exit
//! sentinel `..1` is typed, or the server reports a terminal status.
//!
//! The function is generic over the byte streams so the CLI can hand it a
//! raw-mode terminal while tests hand it in-memory pipes.

use std::time::Duration;

use serde_json::{json, Map};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{self, Payload, ShellData};
use crate::error::StoreError;
use crate::sessions::{self, Feature, Resize, SessionPaths, SessionState, SessionStatus};
use crate::store::{SharedStore, Store, Subscription};

/// Typed locally (possibly across several reads) to leave the session.
const SENTINEL: &[u8; 3] = b"..1";

/// Output still in flight after a terminal status is shown for at most this long.
const FINAL_OUTPUT_GRACE: Duration = Duration::from_millis(300);

/// Detects the exit sentinel across arbitrarily split input chunks.
#[derive(Debug, Default)]
pub struct ExitSentinel {
    tail: Vec<u8>,
}

impl ExitSentinel {
    /// Feed one chunk; `true` when the input so far ends with `..1`.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > SENTINEL.len() {
            self.tail.drain(..self.tail.len() - SENTINEL.len());
        }
        self.tail.as_slice() == SENTINEL
    }
}

/// Why an attached client stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEnd {
    /// The user typed the exit sentinel.
    Sentinel,
    /// Local input reached EOF.
    InputClosed,
    /// The server side ended the session.
    Remote {
        status: SessionStatus,
        exit_code: Option<i32>,
    },
}

/// Client-side options.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub cols: u16,
    pub rows: u16,
    /// How often `state` is polled for a terminal status.
    pub poll_interval: Duration,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            cols: 100,
            rows: 30,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Mark a session as awaiting a server, with the client's terminal size. If a
/// server already holds the session, it is asked to resize instead.
pub async fn announce_client(
    store: &SharedStore,
    paths: &SessionPaths,
    cols: u16,
    rows: u16,
) -> Result<(), StoreError> {
    let mut extra = Map::new();
    extra.insert("cols".into(), json!(cols));
    extra.insert("rows".into(), json!(rows));
    if sessions::announce_client(&**store, paths, extra).await? {
        request_resize(store, paths, Resize { cols, rows }).await?;
    }
    Ok(())
}

/// Ask the server to resize the PTY.
pub async fn request_resize(
    store: &SharedStore,
    paths: &SessionPaths,
    size: Resize,
) -> Result<(), StoreError> {
    let mut fields = Map::new();
    fields.insert("resize".into(), json!(size));
    fields.insert("cols".into(), json!(size.cols));
    fields.insert("rows".into(), json!(size.rows));
    store.update(&paths.state(), fields).await
}

/// Attach to `session_id` until one side ends the session.
pub async fn attach<R, W>(
    store: SharedStore,
    session_id: &str,
    mut input: R,
    mut output: W,
    options: AttachOptions,
    mut resizes: Option<mpsc::Receiver<Resize>>,
) -> Result<AttachEnd, StoreError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let paths = SessionPaths::new(session_id, Feature::Ssh);
    announce_client(&store, &paths, options.cols, options.rows).await?;
    let mut remote = store.subscribe(&paths.output()).await?;
    let input_path = paths.input();

    let mut sentinel = ExitSentinel::default();
    let mut buf = [0u8; 1024];
    let mut poll = tokio::time::interval(options.poll_interval);
    let mut saw_server = false;

    loop {
        tokio::select! {
            n = input.read(&mut buf) => {
                let n = match n {
                    Ok(0) | Err(_) => return Ok(AttachEnd::InputClosed),
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                let msg = ShellData { data: Payload::from(chunk) };
                match codec::encode(&msg) {
                    Ok(value) => { store.push(&input_path, value).await?; }
                    Err(e) => warn!("Failed to encode input: {e}"),
                }
                if sentinel.feed(chunk) {
                    debug!(session_id, "Exit sentinel typed, detaching");
                    return Ok(AttachEnd::Sentinel);
                }
            }
            child = remote.next() => {
                let Some(child) = child else {
                    return Err(StoreError::Closed);
                };
                write_output(&store, &mut output, child).await;
            }
            size = recv_resize(&mut resizes) => {
                match size {
                    Some(size) => request_resize(&store, &paths, size).await?,
                    None => resizes = None,
                }
            }
            _ = poll.tick() => {
                let state = SessionState::from_value(store.get(&paths.state()).await?);
                match state.status {
                    Some(SessionStatus::Connected) => saw_server = true,
                    Some(status) if status.is_terminal() => {
                        flush_remaining(&store, &mut remote, &mut output).await;
                        return Ok(AttachEnd::Remote { status, exit_code: state.exit_code });
                    }
                    // A fresh client record replaced ours after the server left.
                    None if saw_server => {
                        return Ok(AttachEnd::Remote { status: SessionStatus::Disconnected, exit_code: None });
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn recv_resize(resizes: &mut Option<mpsc::Receiver<Resize>>) -> Option<Resize> {
    match resizes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_output<W: AsyncWrite + Unpin>(
    store: &SharedStore,
    output: &mut W,
    child: crate::store::Child,
) {
    if let Err(e) = store.remove(&child.path).await {
        warn!(path = %child.path, "Failed to delete consumed output: {e}");
    }
    match codec::decode::<ShellData>(child.value) {
        Ok(msg) => {
            if output.write_all(msg.data.as_bytes()).await.is_ok() {
                let _ = output.flush().await;
            }
        }
        Err(e) => warn!(key = %child.key, "Dropping malformed shell output: {e}"),
    }
}

async fn flush_remaining<W: AsyncWrite + Unpin>(
    store: &SharedStore,
    remote: &mut Subscription,
    output: &mut W,
) {
    while let Ok(Some(child)) = tokio::time::timeout(FINAL_OUTPUT_GRACE, remote.next()).await {
        write_output(store, output, child).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use crate::tunnel::{shell_server, StopSignal, Worker};
    use std::sync::Arc;

    #[test]
    fn sentinel_spans_chunks() {
        let mut s = ExitSentinel::default();
        assert!(!s.feed(b"ls"));
        assert!(!s.feed(b"."));
        assert!(!s.feed(b"."));
        assert!(s.feed(b"1"));

        let mut s = ExitSentinel::default();
        assert!(s.feed(b"echo ..1"));
        assert!(!s.feed(b"\r"));
    }

    #[tokio::test]
    async fn sentinel_input_is_forwarded_before_detaching() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let (mut typing, input) = tokio::io::duplex(64);
        let (output, _screen) = tokio::io::duplex(64);
        let client = tokio::spawn(attach(
            store.clone(),
            "sent",
            input,
            output,
            AttachOptions::default(),
            None,
        ));
        typing.write_all(b"..1").await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), client)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, AttachEnd::Sentinel);

        let paths = SessionPaths::new("sent", Feature::Ssh);
        let pending = store.get(&paths.input()).await.unwrap().unwrap();
        let forwarded: Vec<u8> = pending
            .as_object()
            .unwrap()
            .values()
            .flat_map(|v| codec::decode::<ShellData>(v.clone()).unwrap().data.into_bytes())
            .collect();
        assert_eq!(forwarded, b"..1");
        let state = SessionState::from_value(store.get(&paths.state()).await.unwrap());
        assert_eq!(state.status, Some(SessionStatus::ClientConnected));
    }

    #[tokio::test]
    async fn attached_client_runs_a_remote_command() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.shell.default_shell = "/bin/sh".into();
        config.shell.login = false;
        config.shell.default_working_dir = "/".into();
        config.shell.term = "dumb".into();

        let (mut typing, input) = tokio::io::duplex(1024);
        let (output, mut screen) = tokio::io::duplex(64 * 1024);
        let options = AttachOptions {
            poll_interval: Duration::from_millis(50),
            ..AttachOptions::default()
        };
        let client = tokio::spawn(attach(store.clone(), "pair", input, output, options, None));

        // Let the client announce itself before the server claims the session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let server = tokio::spawn(shell_server::run(Worker {
            store: store.clone(),
            config: Arc::new(config),
            server_id: "srv".into(),
            session_id: "pair".into(),
            instance_id: "srv_ssh_pair".into(),
            port: None,
            stop: StopSignal::new(),
        }));

        typing.write_all(b"echo out-$((6*7)); exit 5\n").await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(10), client)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            end,
            AttachEnd::Remote {
                status: SessionStatus::Exited,
                exit_code: Some(5)
            }
        );
        server.await.unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(100), screen.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&seen).contains("out-42"));
    }
}
