#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # dbtunnel
//!
//! Shell and HTTP tunnels between machines that never connect to each other:
//! every byte travels through a realtime database.
//!
//! ## Subcommands
//!
//! | Command                                  | Side   | Description                                  |
//! |------------------------------------------|--------|----------------------------------------------|
//! | `dbtunnel serve`                         | server | Register and act on start/stop commands      |
//! | `dbtunnel manage [--port N]`             | server | `serve` plus the management endpoint and UI  |
//! | `dbtunnel ssh <session>`                 | server | Serve one shell session, exit when it ends   |
//! | `dbtunnel http <session> [--port N]`     | server | Serve one HTTP session, exit when stopped    |
//! | `dbtunnel attach <session>`              | client | Attach the local terminal to a shell session |
//! | `dbtunnel proxy <session> [--port N]`    | client | Local HTTP proxy into an HTTP session        |
//! | `dbtunnel supervise [--manage]`          | server | Restart `serve`/`manage` on crash            |
//!
//! While attached, typing `..1` detaches the terminal.

use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use dbtunnel::config::Config;
use dbtunnel::node::{self, InitialFeature};
use dbtunnel::registry::ServerRole;
use dbtunnel::sessions::{Feature, Resize, SessionStatus};
use dbtunnel::shell::pty::window_size;
use dbtunnel::tunnel::http_client::HttpProxy;
use dbtunnel::tunnel::shell_client::{self, AttachEnd, AttachOptions};
use dbtunnel::{store, supervisor};

/// Shell and HTTP tunnels relayed through a realtime database.
#[derive(Parser)]
#[command(name = "dbtunnel", version)]
struct Cli {
    /// Path to TOML config file (default: ./dbtunnel.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server node that acts on start/stop commands (default).
    Serve,
    /// Run a server node with the management endpoint.
    Manage {
        /// Port for the management endpoint (overrides `[manage] listen`).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Serve one shell session and exit when it ends.
    Ssh {
        session: String,
    },
    /// Serve one HTTP session and exit when it is stopped.
    Http {
        session: String,
        /// Forward every request to this local port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Attach this terminal to a shell session.
    Attach {
        session: String,
    },
    /// Run a local HTTP proxy into an HTTP session.
    Proxy {
        session: String,
        /// Fixed target port; otherwise the first path segment names it.
        #[arg(long)]
        port: Option<u16>,
        /// Local listen address (overrides `[http] proxy_listen`).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run as supervisor: starts a node and restarts it on crash.
    Supervise {
        /// Supervise a `manage` node instead of `serve`.
        #[arg(long)]
        manage: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    let mut config = Config::load(config_path);
    init_tracing(&config);

    let code = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_node(config, ServerRole::Serve, None).await,
        Commands::Manage { port } => {
            if let Some(port) = port {
                config.manage.listen = with_port(&config.manage.listen, port);
            }
            run_node(config, ServerRole::Manage, None).await
        }
        Commands::Ssh { session } => {
            let initial = InitialFeature {
                feature: Feature::Ssh,
                session_id: session,
                port: None,
            };
            run_node(config, ServerRole::Ssh, Some(initial)).await
        }
        Commands::Http { session, port } => {
            let initial = InitialFeature {
                feature: Feature::Http,
                session_id: session,
                port,
            };
            run_node(config, ServerRole::Http, Some(initial)).await
        }
        Commands::Attach { session } => run_attach(&config, &session).await,
        Commands::Proxy {
            session,
            port,
            listen,
        } => {
            if port.is_some() {
                config.http.fixed_port = port;
            }
            if let Some(listen) = listen {
                config.http.proxy_listen = listen;
            }
            run_proxy(&config, &session).await
        }
        Commands::Supervise { manage } => {
            info!("dbtunnel supervisor starting");
            supervisor::run_supervisor(config_path, &config.supervisor, manage).await
        }
    };

    // stdin is read on a blocking thread that would keep the runtime alive.
    std::process::exit(code);
}

/// Logs go to stderr: stdout belongs to the attached terminal.
fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Replace the port of a `host:port` listen address.
fn with_port(listen: &str, port: u16) -> String {
    let host = listen.rsplit_once(':').map_or(listen, |(host, _)| host);
    format!("{host}:{port}")
}

async fn run_node(config: Config, role: ServerRole, initial: Option<InitialFeature>) -> i32 {
    match node::run_node(config, role, initial).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

/// Puts stdin in raw mode until dropped.
struct RawMode {
    original: Termios,
}

impl RawMode {
    fn enable() -> nix::Result<Self> {
        let stdin = std::io::stdin();
        let original = tcgetattr(&stdin)?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        Ok(Self { original })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.original);
    }
}

async fn run_attach(config: &Config, session: &str) -> i32 {
    let store = store::open(&config.store).expect("Failed to open store");
    let (rows, cols) = window_size(&std::io::stdout())
        .unwrap_or((config.shell.default_rows, config.shell.default_cols));
    let options = AttachOptions {
        cols,
        rows,
        ..AttachOptions::default()
    };

    let raw = if std::io::stdin().is_terminal() {
        match RawMode::enable() {
            Ok(raw) => Some(raw),
            Err(e) => {
                error!("Failed to enter raw mode: {e}");
                None
            }
        }
    } else {
        None
    };

    let (resize_tx, resize_rx) = mpsc::channel(4);
    let winch_task = tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut winch) = signal(SignalKind::window_change()) else {
            return;
        };
        while winch.recv().await.is_some() {
            if let Some((rows, cols)) = window_size(&std::io::stdout()) {
                if resize_tx.send(Resize { cols, rows }).await.is_err() {
                    break;
                }
            }
        }
    });

    eprintln!("Attaching to session {session} (type ..1 to detach)\r");
    let end = shell_client::attach(
        store,
        session,
        tokio::io::stdin(),
        tokio::io::stdout(),
        options,
        Some(resize_rx),
    )
    .await;
    winch_task.abort();
    drop(raw);

    match end {
        Ok(AttachEnd::Sentinel) => {
            eprintln!("\nDetached from session {session}");
            0
        }
        Ok(AttachEnd::InputClosed) => 0,
        Ok(AttachEnd::Remote { status, exit_code }) => {
            eprintln!("\nSession {session} ended: {status}");
            match (status, exit_code) {
                (SessionStatus::Exited, Some(code)) => code,
                (SessionStatus::Exited | SessionStatus::Stopped, None) => 0,
                _ => 1,
            }
        }
        Err(e) => {
            eprintln!("\nSession {session} failed: {e}");
            1
        }
    }
}

async fn run_proxy(config: &Config, session: &str) -> i32 {
    let store = store::open(&config.store).expect("Failed to open store");
    let proxy = match HttpProxy::start(store, session, &config.http).await {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("Failed to start proxy: {e}");
            return 1;
        }
    };
    let listener = TcpListener::bind(&config.http.proxy_listen)
        .await
        .expect("Failed to bind proxy listener");
    match config.http.fixed_port {
        Some(port) => info!(
            "Proxy for session {session} on http://{} → port {port}",
            config.http.proxy_listen
        ),
        None => info!(
            "Proxy for session {session} on http://{}/{{port}}/...",
            config.http.proxy_listen
        ),
    }
    match proxy.serve(listener, node::shutdown_signal()).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Proxy server error: {e}");
            1
        }
    }
}
