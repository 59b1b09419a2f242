//! Built-in supervisor that restarts the node on crash.
//!
//! `dbtunnel supervise` runs `dbtunnel serve` (or `manage`) as a child
//! process. On abnormal exit the node is restarted with exponential backoff;
//! a clean exit (code 0) stops the supervisor. SIGINT/SIGTERM are forwarded
//! to the child, which deregisters itself before exiting.

use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Restart delay: doubles on quick crashes, resets after a stable run.
#[derive(Debug)]
pub struct Backoff {
    current: u64,
    max: u64,
    stable_threshold: Duration,
}

impl Backoff {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            current: 1,
            max: config.max_backoff.max(1),
            stable_threshold: Duration::from_secs(config.stable_threshold),
        }
    }

    /// Delay before the next restart.
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.current)
    }

    /// Account for a run that lasted `uptime`.
    pub fn record(&mut self, uptime: Duration) {
        self.current = if uptime >= self.stable_threshold {
            1
        } else {
            (self.current * 2).min(self.max)
        };
    }
}

/// Run the supervisor loop. Does not return unless the child exits cleanly.
pub async fn run_supervisor(
    config_path: Option<&str>,
    sup_config: &SupervisorConfig,
    manage: bool,
) -> ! {
    let mut backoff = Backoff::new(sup_config);
    let exe = std::env::current_exe().expect("resolve own executable path");
    let role = if manage { "manage" } else { "serve" };

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(&exe);
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }
        cmd.arg(role);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Supervisor: failed to spawn node: {e}, retrying in {:?}", backoff.delay());
                tokio::time::sleep(backoff.delay()).await;
                backoff.record(Duration::ZERO);
                continue;
            }
        };
        let node_pid = child.id();
        info!("Supervisor: started {role} node (pid {node_pid:?})");

        let signal_task = tokio::spawn(forward_signals(node_pid));
        let status = child.wait().await;
        signal_task.abort();
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Node exited cleanly, supervisor stopping");
                std::process::exit(0);
            }
            Ok(s) => warn!(
                "Node exited: {s} (uptime {:.1}s), restarting in {:?}",
                uptime.as_secs_f64(),
                backoff.delay()
            ),
            Err(e) => error!(
                "Node wait error: {e} (uptime {:.1}s), restarting in {:?}",
                uptime.as_secs_f64(),
                backoff.delay()
            ),
        }
        tokio::time::sleep(backoff.delay()).await;
        backoff.record(uptime);
    }
}

/// Forward the first SIGINT or SIGTERM to the child.
async fn forward_signals(pid: Option<u32>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Supervisor: could not register signal handlers");
        return;
    };
    let sig = tokio::select! {
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
    };
    info!("Supervisor: forwarding signal {sig} to node");
    if let Some(pid) = pid {
        #[allow(clippy::cast_possible_wrap)]
        // SAFETY: kill(2) on a child pid we spawned.
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }
}
