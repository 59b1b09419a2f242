#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! dbtunnel library: shell and HTTP tunnels relayed through a realtime
//! database.
//!
//! - `store`: the pub/sub mailbox primitive (REST/SSE and in-memory backends)
//! - `codec`: wire envelopes and base64 payloads
//! - `sessions`: session paths, status machine, `info` records
//! - `tunnel`: shell and HTTP tunnel peers
//! - `registry`: server records, liveness, control commands
//! - `controller`: owner of the feature instances running on a node
//! - `routes`: management HTTP surface
//! - `node`: wiring of a server node

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod node;
pub mod registry;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use controller::Controller;
pub use state::AppState;
pub use store::{SharedStore, Store};
