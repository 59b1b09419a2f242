//! `GET /api/status`: registry overview grouped by server type.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Map, Value};
use tracing::error;

use crate::registry::{classify, SERVERS};
use crate::sessions::{Feature, SESSIONS};
use crate::store::Store;
use crate::util::now_ms;
use crate::AppState;

/// Registered servers plus the feature instances found in the session tree.
///
/// ```json
/// { "manage": { "servers": [ { "serverId": "...", "liveness": "online", ... } ] },
///   "ssh":    { "servers": [ ... ] },
///   "events": [ ... ] }
/// ```
pub async fn status(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let fail = |e: crate::error::StoreError| {
        error!("Failed to fetch server status: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Failed to fetch server status"})),
        )
    };
    let servers = state.store.get(SERVERS).await.map_err(fail)?;
    let sessions = state.store.get(SESSIONS).await.map_err(fail)?;
    let stale_after = state.config.registry.stale_after_ms();

    let mut result = build_status(servers.as_ref(), sessions.as_ref(), now_ms(), stale_after);
    result.insert("events".into(), Value::Array(state.events.recent().await));
    Ok(Json(Value::Object(result)))
}

/// Group `servers` by type, then add session-derived entries for instances
/// that have no matching server record.
pub fn build_status(
    servers: Option<&Value>,
    sessions: Option<&Value>,
    now: u64,
    stale_after_ms: u64,
) -> Map<String, Value> {
    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for kind in ["manage", "serve", "ssh", "http"] {
        groups.insert(kind.to_string(), Vec::new());
    }

    for (key, server) in servers.and_then(Value::as_object).into_iter().flatten() {
        let kind = server
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let mut entry = json!({
            "serverId": server.get("serverId").cloned().unwrap_or_else(|| json!(key)),
            "host": server.get("host"),
            "ip": server.get("ip"),
            "startedAt": server.get("startedAt"),
            "status": server.get("status"),
            "pid": server.get("pid"),
            "liveness": classify(server, now, stale_after_ms),
        });
        for optional in ["sessionId", "port"] {
            if let Some(v) = server.get(optional) {
                entry[optional] = v.clone();
            }
        }
        groups.entry(kind).or_default().push(entry);
    }

    for (session_id, session) in sessions.and_then(Value::as_object).into_iter().flatten() {
        for feature in Feature::ALL {
            let Some(info) = session.get(feature.as_str()).and_then(|f| f.get("info")) else {
                continue;
            };
            let server_id = info.get("serverId").cloned().unwrap_or(Value::Null);
            let group = groups.entry(feature.as_str().to_string()).or_default();
            let listed = group.iter().any(|e| {
                e["serverId"] == server_id && e["sessionId"].as_str() == Some(session_id.as_str())
            });
            if listed {
                continue;
            }
            let mut entry = json!({
                "serverId": server_id,
                "sessionId": session_id,
                "instanceId": info.get("instanceId"),
                "host": info.pointer("/server/hostname"),
                "ip": info.pointer("/server/ip"),
                "startedAt": info.get("startedAt"),
                "status": info.get("status"),
                "pid": info.get("pid"),
                "liveness": classify(info, now, stale_after_ms),
            });
            if let Some(port) = info.get("port") {
                entry["port"] = port.clone();
            }
            group.push(entry);
        }
    }

    groups
        .into_iter()
        .map(|(kind, servers)| (kind, json!({ "servers": servers })))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_servers_and_adds_session_instances() {
        let now = 100_000;
        let servers = json!({
            "m1": {"serverId": "m1", "type": "manage", "host": "h", "ip": "10.0.0.1", "pid": 1,
                   "status": "online", "startedAt": 1, "lastHeartbeat": now - 1_000, "port": 55777},
            "old": {"serverId": "old", "type": "serve", "host": "h2", "ip": "10.0.0.2", "pid": 2,
                    "status": "online", "startedAt": 1, "lastHeartbeat": 10},
            "s1": {"serverId": "s1", "type": "ssh", "sessionId": "abc", "host": "h3", "ip": "x",
                   "pid": 3, "status": "online", "startedAt": 1, "lastHeartbeat": now}
        });
        let sessions = json!({
            "abc": {"ssh": {"info": {"serverId": "s1", "instanceId": "s1_ssh_abc", "status": "online",
                                     "lastHeartbeat": now, "pid": 3, "server": {"hostname": "h3"}}}},
            "web": {"http": {"info": {"serverId": "m1", "instanceId": "m1_http_web", "status": "online",
                                      "lastHeartbeat": now, "pid": 1, "port": 3000,
                                      "server": {"hostname": "h", "ip": "10.0.0.1"}}},
                    "ssh": {"state": {"status": "client-connected"}}}
        });

        let out = build_status(Some(&servers), Some(&sessions), now, 45_000);

        let manage = out["manage"]["servers"].as_array().unwrap();
        assert_eq!(manage[0]["liveness"], "online");
        assert_eq!(manage[0]["port"], 55777);
        assert_eq!(out["serve"]["servers"][0]["liveness"], "stale");

        // The dedicated ssh server is listed once, not again from its session.
        assert_eq!(out["ssh"]["servers"].as_array().unwrap().len(), 1);

        let http = out["http"]["servers"].as_array().unwrap();
        assert_eq!(http.len(), 1);
        assert_eq!(http[0]["instanceId"], "m1_http_web");
        assert_eq!(http[0]["sessionId"], "web");
        assert_eq!(http[0]["port"], 3000);
        assert_eq!(http[0]["host"], "h");
    }

    #[test]
    fn empty_store_yields_empty_groups() {
        let out = build_status(None, None, 0, 45_000);
        assert_eq!(out["ssh"], json!({"servers": []}));
        assert_eq!(out["manage"], json!({"servers": []}));
    }
}
