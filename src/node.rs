//! Server node: registry record, command listener, controller and (for the
//! `manage` role) the management endpoint, wired together with graceful
//! shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::registry::command::CommandInbox;
use crate::registry::{Registration, ServerRecord, ServerRole};
use crate::sessions::Feature;
use crate::state::{AppState, EventLog};
use crate::store;

/// A feature the node starts on its own, for the `ssh` / `http` roles.
#[derive(Debug, Clone)]
pub struct InitialFeature {
    pub feature: Feature,
    pub session_id: String,
    pub port: Option<u16>,
}

/// Run a node until it is signalled, told to stop, or (with an initial
/// feature) that feature ends.
pub async fn run_node(
    config: Config,
    role: ServerRole,
    initial: Option<InitialFeature>,
) -> Result<(), ControllerError> {
    let config = Arc::new(config);
    let store = store::open(&config.store).expect("Failed to open store");
    let server_id = role.server_id(
        &config.server_id(),
        initial.as_ref().map(|i| i.session_id.as_str()),
    );
    info!(server_id = %server_id, %role, "dbtunnel v{} starting", env!("CARGO_PKG_VERSION"));

    let manage_listener = if role == ServerRole::Manage {
        let listener = TcpListener::bind(&config.manage.listen)
            .await
            .expect("Failed to bind management listener");
        info!("Management endpoint on http://{}", config.manage.listen);
        Some(listener)
    } else {
        None
    };
    let record_port = match (&manage_listener, &initial) {
        (Some(l), _) => l.local_addr().ok().map(|a| a.port()),
        (None, Some(i)) => i.port,
        (None, None) => None,
    };
    let record = ServerRecord::local(
        &server_id,
        role,
        record_port,
        initial.as_ref().map(|i| i.session_id.as_str()),
    );
    let registration =
        Registration::register(store.clone(), &record, config.registry.heartbeat_interval())
            .await
            .expect("Failed to register in server registry");
    let inbox = CommandInbox::listen(store.clone(), &server_id)
        .await
        .expect("Failed to subscribe to commands");

    let events = Arc::new(EventLog::new());
    let mut controller = Controller::new(store.clone(), config.clone(), &server_id, events.clone());

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let manage_task = manage_listener.map(|listener| {
        let app = crate::routes::router(AppState {
            config: config.clone(),
            store: store.clone(),
            server_id: server_id.clone(),
            start_time: Instant::now(),
            events: events.clone(),
        });
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                error!("Management server error: {e}");
            }
        })
    });

    let mut result = Ok(());
    let exit_when_idle = initial.is_some();
    if let Some(i) = initial {
        if let Err(e) = controller.start(i.feature, &i.session_id, i.port).await {
            error!(session_id = %i.session_id, feature = %i.feature, "Failed to start: {e}");
            result = Err(e);
        }
    }
    if result.is_ok() {
        controller.run(inbox, shutdown.clone(), exit_when_idle).await;
    }

    info!("Shutting down...");
    shutdown.cancel();
    signal_task.abort();
    if let Some(task) = manage_task {
        let _ = task.await;
    }
    if let Err(e) = registration.deregister().await {
        warn!("Failed to deregister: {e}");
    }
    info!("Goodbye");
    result
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to register SIGTERM");
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
