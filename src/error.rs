//! Error types shared across the crate.

use thiserror::Error;

/// Failures talking to the realtime store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network-level failure (connection refused, DNS, TLS, reset).
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered with a non-2xx status.
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The store answered with something we could not interpret.
    #[error("store protocol error: {0}")]
    Protocol(String),
    /// A path segment contains characters the store does not accept.
    #[error("invalid store path '{0}'")]
    InvalidPath(String),
    /// The store (or its event stream) has been shut down.
    #[error("store closed")]
    Closed,
}

/// Failures decoding a wire envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures reported by the feature-instance controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A feature instance for this `(session, feature)` pair is already live.
    #[error("Session already running")]
    AlreadyRunning(String),
    /// No instance with this id is running on this server.
    #[error("no running instance '{0}'")]
    NotRunning(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures spawning or driving a local shell.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to allocate PTY: {0}")]
    Pty(#[from] nix::Error),
    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("shell input closed")]
    InputClosed,
}
