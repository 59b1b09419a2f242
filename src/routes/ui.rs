//! `GET /`: operator UI.

use axum::{
    extract::State,
    response::{Html, IntoResponse, Response},
};
use tracing::warn;

use crate::util::expand_tilde;
use crate::AppState;

/// Minimal page used when no `[manage] ui_path` is configured.
const BUILTIN_UI: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>dbtunnel</title>
<style>
body { font-family: monospace; margin: 2em; }
table { border-collapse: collapse; margin-bottom: 1.5em; }
td, th { border: 1px solid #999; padding: 0.25em 0.6em; }
.stale { color: #b60; } .online { color: #080; }
</style>
</head>
<body>
<h1>dbtunnel</h1>
<form id="start">
  <select name="feature"><option>ssh</option><option>http</option></select>
  <input name="sessionId" placeholder="session id" required>
  <input name="port" placeholder="port (http)" size="6">
  <input name="serverId" placeholder="server id (optional)">
  <button>start</button>
</form>
<div id="status"></div>
<h2>sessions</h2>
<pre id="sessions"></pre>
<script>
async function post(feature, body) {
  const r = await fetch(`/api/feature/${feature}`, {
    method: "POST",
    headers: {"Content-Type": "application/json"},
    body: JSON.stringify(body),
  });
  const j = await r.json();
  if (j.error) alert(j.error);
  refresh();
}
function stop(feature, instanceId) { post(feature, {action: "stop", instanceId}); }
async function refresh() {
  const status = await (await fetch("/api/status")).json();
  let html = "";
  for (const [kind, group] of Object.entries(status)) {
    if (kind === "events" || !group.servers.length) continue;
    html += `<h2>${kind}</h2><table><tr><th>server</th><th>session</th><th>host</th><th>port</th><th>status</th><th>liveness</th><th></th></tr>`;
    for (const s of group.servers) {
      const id = s.instanceId || (s.sessionId ? `${s.serverId}_${kind}_${s.sessionId}` : "");
      const btn = id && (kind === "ssh" || kind === "http")
        ? `<button onclick="stop('${kind}','${id}')">stop</button>` : "";
      html += `<tr><td>${s.serverId}</td><td>${s.sessionId ?? ""}</td><td>${s.host ?? ""}</td>` +
        `<td>${s.port ?? ""}</td><td>${s.status ?? ""}</td><td class="${s.liveness}">${s.liveness}</td><td>${btn}</td></tr>`;
    }
    html += "</table>";
  }
  document.getElementById("status").innerHTML = html;
  const sessions = await (await fetch("/api/sessions")).json();
  document.getElementById("sessions").textContent = JSON.stringify(sessions, null, 2);
}
document.getElementById("start").onsubmit = (e) => {
  e.preventDefault();
  const f = new FormData(e.target);
  const body = {action: "start", sessionId: f.get("sessionId")};
  if (f.get("port")) body.port = Number(f.get("port"));
  if (f.get("serverId")) body.serverId = f.get("serverId");
  post(f.get("feature"), body);
};
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;

/// Serve the configured UI file, falling back to the built-in page.
pub async fn index(State(state): State<AppState>) -> Response {
    if let Some(path) = &state.config.manage.ui_path {
        match tokio::fs::read_to_string(expand_tilde(path).as_ref()).await {
            Ok(doc) => return Html(doc).into_response(),
            Err(e) => warn!(path = %path, "Failed to read UI file, serving built-in page: {e}"),
        }
    }
    Html(BUILTIN_UI).into_response()
}
