//! Management HTTP surface.
//!
//! | Method | Path                    | Description                                |
//! |--------|-------------------------|--------------------------------------------|
//! | GET    | `/`                     | Operator UI                                |
//! | GET    | `/api/health`           | Liveness probe                             |
//! | GET    | `/api/status`           | Servers by type, liveness, recent events   |
//! | GET    | `/api/sessions`         | Session tree with feature status           |
//! | POST   | `/api/feature/{feature}` | Start/stop a feature via a server command |

pub mod feature;
pub mod health;
pub mod sessions;
pub mod status;
pub mod ui;

use axum::{
    http::{header, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(ui::index))
        .route("/api/health", get(health::health))
        .route("/api/status", get(status::status))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/feature/{feature}", post(feature::feature))
        .fallback(|| async { (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"}))) })
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
