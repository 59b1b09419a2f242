//! `GET /api/sessions`: the session tree, flattened for UIs.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::error;

use crate::sessions::{Feature, SESSIONS};
use crate::store::Store;
use crate::AppState;

/// List every session with the features that have a record under it.
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let tree = state.store.get(SESSIONS).await.map_err(|e| {
        error!("Failed to fetch sessions: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Failed to fetch sessions"})),
        )
    })?;
    Ok(Json(Value::Array(summarize(tree.as_ref()))))
}

/// `[{sessionId, features: [{type, info, status}]}]`, sessions in id order.
pub fn summarize(tree: Option<&Value>) -> Vec<Value> {
    let Some(sessions) = tree.and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut ids: Vec<&String> = sessions.keys().collect();
    ids.sort();

    ids.into_iter()
        .map(|id| {
            let session = &sessions[id.as_str()];
            let features: Vec<Value> = Feature::ALL
                .iter()
                .filter_map(|feature| {
                    let record = session.get(feature.as_str())?;
                    Some(json!({
                        "type": feature.as_str(),
                        "info": record.get("info").cloned().unwrap_or(Value::Null),
                        "status": record.pointer("/state/status").cloned().unwrap_or(Value::Null),
                    }))
                })
                .collect();
            json!({ "sessionId": id, "features": features })
        })
        .collect()
}
