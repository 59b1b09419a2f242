//! `POST /api/feature/{ssh|http}`: start or stop a feature on some server.
//!
//! The management node never spawns anything itself: both actions become a
//! command on `commands/{serverId}`, and the target server's controller acts
//! on it. The target defaults to this node.
//!
//! | Body                                              | Command sent            |
//! |---------------------------------------------------|-------------------------|
//! | `{action:"start", sessionId, port?, serverId?}`   | `startSSH` / `startHTTP` |
//! | `{action:"stop", sessionId, serverId?}`           | `stopSSH` / `stopHTTP`   |
//! | `{action:"stop", instanceId}`                     | same, to the id's server |

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::registry::command::{self, Action};
use crate::registry::server_path;
use crate::sessions::{self, Feature, SessionPaths};
use crate::store::Store;
use crate::util::now_ms;
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequest {
    pub action: String,
    pub session_id: Option<String>,
    pub port: Option<u16>,
    pub server_id: Option<String>,
    pub instance_id: Option<String>,
}

fn bad_request(msg: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

fn internal(e: &impl std::fmt::Display) -> ApiError {
    error!("Feature request failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

pub async fn feature(
    State(state): State<AppState>,
    Path(feature): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: FeatureRequest =
        serde_json::from_slice(&body).map_err(|_| bad_request("Invalid request"))?;
    let feature: Feature = feature
        .parse()
        .map_err(|_| bad_request("Invalid feature type"))?;

    match req.action.as_str() {
        "start" => start(&state, feature, req).await,
        "stop" => stop(&state, feature, req).await,
        _ => Err(bad_request("Unknown action")),
    }
}

async fn start(state: &AppState, feature: Feature, req: FeatureRequest) -> Result<Json<Value>, ApiError> {
    let session_id = req
        .session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("Session ID is required"))?;
    let server_id = req.server_id.unwrap_or_else(|| state.server_id.clone());
    ensure_server(state, &server_id).await?;

    let instance_id = sessions::instance_id(&server_id, feature, &session_id);
    let paths = SessionPaths::new(&session_id, feature);
    if let Some(current) = state.store.get(&paths.info()).await.map_err(|e| internal(&e))? {
        let owner = current.get("instanceId").and_then(Value::as_str);
        let stale_after = state.config.registry.stale_after_ms();
        if owner != Some(instance_id.as_str())
            && sessions::is_live_owner(&current, now_ms(), stale_after)
        {
            return Err(bad_request("Session already running"));
        }
    }

    command::send(&*state.store, &server_id, Action::start(feature, &session_id, req.port))
        .await
        .map_err(|e| internal(&e))?;
    info!(server_id = %server_id, session_id = %session_id, %feature, "Start requested");

    Ok(Json(json!({
        "success": true,
        "serverId": server_id,
        "instanceId": instance_id,
        "message": format!("Started {feature} session with ID {session_id}"),
    })))
}

async fn stop(state: &AppState, feature: Feature, req: FeatureRequest) -> Result<Json<Value>, ApiError> {
    let (server_id, session_id) = stop_target(state, feature, &req)?;
    ensure_server(state, &server_id).await?;

    command::send(&*state.store, &server_id, Action::stop(feature, &session_id))
        .await
        .map_err(|e| internal(&e))?;
    info!(server_id = %server_id, session_id = %session_id, %feature, "Stop requested");

    Ok(Json(json!({
        "success": true,
        "serverId": server_id,
        "instanceId": sessions::instance_id(&server_id, feature, &session_id),
    })))
}

/// Resolve `(serverId, sessionId)` for a stop. An instance id names both.
fn stop_target(
    state: &AppState,
    feature: Feature,
    req: &FeatureRequest,
) -> Result<(String, String), ApiError> {
    let from_instance = |id: &str| {
        sessions::parse_instance_id(id).filter(|(_, f, _)| *f == feature)
    };

    if let Some(id) = &req.instance_id {
        let (server, _, session) =
            from_instance(id).ok_or_else(|| bad_request("Invalid instance ID"))?;
        return Ok((server, session));
    }
    let session_id = req
        .session_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("Session ID is required"))?;
    if req.server_id.is_none() {
        if let Some((server, _, session)) = from_instance(&session_id) {
            return Ok((server, session));
        }
    }
    let server_id = req.server_id.clone().unwrap_or_else(|| state.server_id.clone());
    Ok((server_id, session_id))
}

/// 404 unless `server_id` is this node or has a registry record.
async fn ensure_server(state: &AppState, server_id: &str) -> Result<(), ApiError> {
    if server_id == state.server_id {
        return Ok(());
    }
    let record = state
        .store
        .get(&server_path(server_id))
        .await
        .map_err(|e| internal(&e))?;
    if record.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Server not found" })),
        ));
    }
    Ok(())
}
