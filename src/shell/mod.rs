//! Local interactive shell on a PTY.
//!
//! [`PtyShell::spawn`] starts the configured shell as a session leader on a
//! fresh PTY and wires three background tasks around the master fd:
//!
//! - **writer**: mpsc → PTY master, raw bytes, flushed per chunk
//! - **reader**: PTY master → [`PtyShell::output`], one message per `read(2)`
//! - **exit watcher**: `wait()` → [`PtyShell::exit`]
//!
//! Bytes are passed through untouched; the terminal on the far side of the
//! tunnel does all interpretation.

pub mod pty;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::ShellConfig;
use crate::error::ShellError;

/// Parameters for one shell spawn.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub shell: String,
    pub login: bool,
    pub working_dir: String,
    pub rows: u16,
    pub cols: u16,
    pub env: HashMap<String, String>,
}

impl ShellSpec {
    /// Spec from configuration with the given terminal size.
    pub fn from_config(config: &ShellConfig, rows: u16, cols: u16) -> Self {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), config.term.clone());
        Self {
            shell: config.default_shell.clone(),
            login: config.login,
            working_dir: crate::util::expand_tilde(&config.default_working_dir).into_owned(),
            rows,
            cols,
            env,
        }
    }
}

/// A running shell attached to a PTY.
pub struct PtyShell {
    /// OS process id (also the process group id: the shell is a session leader).
    pub pid: u32,
    /// Output chunks in emission order. Closed once the PTY reports EOF/EIO.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// `Some(code)` once the shell has exited.
    pub exit: watch::Receiver<Option<i32>>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    master: OwnedFd,
}

fn dup_fd(fd: &OwnedFd) -> std::io::Result<tokio::fs::File> {
    // SAFETY: dup() on a valid fd; the returned fd is owned by the File.
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `raw` is a fresh descriptor nobody else owns.
    Ok(tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(raw) }))
}

impl PtyShell {
    pub fn spawn(spec: &ShellSpec) -> Result<Self, ShellError> {
        let pair = pty::allocate_pty(spec.rows, spec.cols)?;
        let mut child =
            pty::spawn_shell_pty(&pair, &spec.shell, spec.login, &spec.working_dir, &spec.env)?;
        let pid = child.id().unwrap_or(0);
        let pty::PtyPair { master, slave } = pair;
        // Only the child may hold the slave, or the reader never sees EOF.
        drop(slave);

        let mut writer = dup_fd(&master)?;
        let mut reader = dup_fd(&master)?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let (output_tx, output) = mpsc::channel::<Vec<u8>>(256);
        let output_task = tokio::spawn(async move {
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.send(tmp[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(pid, "PTY output closed");
        });

        let (exit_tx, exit) = watch::channel(None);
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(s) => s
                    .code()
                    .or_else(|| s.signal().map(|sig| 128 + sig))
                    .unwrap_or(-1),
                Err(e) => {
                    error!(pid, "Shell wait error: {e}");
                    -1
                }
            };
            debug!(pid, code, "Shell exited");
            let _ = exit_tx.send(Some(code));
        });

        Ok(Self {
            pid,
            output,
            exit,
            stdin_tx,
            tasks: vec![stdin_task, output_task, exit_task],
            master,
        })
    }

    /// Queue raw bytes for the shell's terminal input.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), ShellError> {
        self.stdin_tx
            .send(data)
            .await
            .map_err(|_| ShellError::InputClosed)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ShellError> {
        Ok(pty::resize_pty(&self.master, rows, cols)?)
    }

    /// Exit code, if the shell has already exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// SIGHUP + SIGTERM the process group, wait up to 3 s, then SIGKILL.
    pub async fn graceful_kill(&mut self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 && self.exit_code().is_none() {
            // Interactive shells ignore SIGTERM but exit on hangup.
            // SAFETY: signalling our own child's process group.
            unsafe {
                libc::kill(-pgid, libc::SIGHUP);
                libc::kill(-pgid, libc::SIGTERM);
            }
            let exited = tokio::time::timeout(
                std::time::Duration::from_secs(3),
                self.exit.wait_for(Option::is_some),
            )
            .await
            .is_ok();
            if !exited {
                // SAFETY: as above.
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(1),
                    self.exit.wait_for(Option::is_some),
                )
                .await;
            }
        }
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
