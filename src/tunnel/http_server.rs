//! Server side of the HTTP tunnel.
//!
//! Consumes `sessions/{id}/http/input`, forwards each request to
//! `http://{local_host}:{port}{uri}` and answers on `output`:
//!
//! - **buffered**: one message `{reqId, status, headers, body}`
//! - **streamed**: `{reqId, type: "start", status, headers}` on `output`, then
//!   `{type: "chunk"}` frames and a final `{type: "end"}` on
//!   `streams/{reqId}_stream`
//! - **upstream failure**: `{reqId, type: "error", status: 502, body: "Error: …"}`
//!
//! Requests are handled concurrently; each owns its `reqId` and its stream
//! path, so they never interfere.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Map};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use super::{Worker, WorkerExit};
use crate::codec::{self, HttpRequest, HttpResponse, Payload, ResponseKind, StreamFrame};
use crate::config::{HttpConfig, ResponseMode};
use crate::error::StoreError;
use crate::host::SystemInfo;
use crate::sessions::{
    Feature, InfoPublisher, InfoStatus, SessionInfo, SessionPaths, SessionStatus, StateWriter,
};
use crate::store::{Child, SharedStore, Store};
use crate::util::now_ms;

type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Shared by all request tasks of one instance.
struct Forwarder {
    store: SharedStore,
    paths: SessionPaths,
    client: UpstreamClient,
    local_host: String,
    pinned_port: Option<u16>,
    mode: ResponseMode,
    upstream_timeout: Duration,
}

/// Run one HTTP instance until stopped.
pub async fn run(worker: Worker) -> WorkerExit {
    let store = worker.store.clone();
    let paths = SessionPaths::new(&worker.session_id, Feature::Http);

    let mut state = match StateWriter::open(store.clone(), &paths).await {
        Ok(s) => s,
        Err(e) => return WorkerExit::failed(format!("failed to read session state: {e}")),
    };

    let now = now_ms();
    let session_info = SessionInfo {
        server: SystemInfo::collect(),
        server_id: worker.server_id.clone(),
        instance_id: worker.instance_id.clone(),
        pid: std::process::id(),
        port: worker.port,
        status: InfoStatus::Online,
        started_at: now,
        last_heartbeat: now,
    };
    let publisher = match InfoPublisher::publish(
        store.clone(),
        &paths,
        &session_info,
        worker.config.registry.heartbeat_interval(),
    )
    .await
    {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(session_id = %worker.session_id, "Failed to publish session info: {e}");
            None
        }
    };

    let mut fields = Map::new();
    fields.insert("serverId".into(), json!(worker.server_id));
    if let Some(port) = worker.port {
        fields.insert("port".into(), json!(port));
    }
    if let Err(e) = state.transition(SessionStatus::Connected, fields).await {
        warn!(session_id = %worker.session_id, "Failed to mark session connected: {e}");
    }
    info!(session_id = %worker.session_id, port = ?worker.port, "HTTP tunnel ready");

    let forwarder = Arc::new(Forwarder::new(store.clone(), paths.clone(), &worker.config.http, worker.port));
    let exit = serve(&worker, forwarder, publisher.as_ref()).await;

    if let Err(e) = state.transition(exit.status, exit.fields()).await {
        warn!(session_id = %worker.session_id, "Failed to write final state: {e}");
    }
    if let Some(publisher) = publisher {
        if let Err(e) = publisher.finish(exit.info_status(), exit.fields()).await {
            warn!(session_id = %worker.session_id, "Failed to finish session info: {e}");
        }
    }
    exit
}

async fn serve(
    worker: &Worker,
    forwarder: Arc<Forwarder>,
    publisher: Option<&InfoPublisher>,
) -> WorkerExit {
    let mut input = match worker.store.subscribe(&forwarder.paths.input()).await {
        Ok(s) => s,
        Err(e) => return WorkerExit::failed(format!("failed to subscribe to input: {e}")),
    };
    let mut in_flight = JoinSet::new();
    let mut client_recorded = false;

    let exit = loop {
        tokio::select! {
            reason = worker.stop.stopped() => break WorkerExit::stopped(reason),
            msg = input.next() => {
                let Some(msg) = msg else {
                    break WorkerExit::failed("input subscription closed");
                };
                let Some(request) = take_request(&*worker.store, msg).await else {
                    continue;
                };
                if !client_recorded {
                    if let (Some(client), Some(publisher)) = (&request.client_info, publisher) {
                        client_recorded = true;
                        if let Err(e) = publisher.record_client(client).await {
                            warn!("Failed to record client info: {e}");
                        }
                    }
                }
                let span = tracing::info_span!("http_request", req_id = %request.req_id);
                let fwd = forwarder.clone();
                in_flight.spawn(async move { fwd.handle(request).await }.instrument(span));
            },
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!("HTTP request task panicked: {e}");
                    }
                }
            },
        }
    };

    if !in_flight.is_empty() {
        debug!(in_flight = in_flight.len(), "Aborting in-flight requests");
    }
    in_flight.shutdown().await;
    exit
}

/// Delete an input message and decode it. Messages that cannot be parsed are
/// dropped; if they at least carry a `reqId`, the client gets a 400.
async fn take_request(store: &dyn Store, msg: Child) -> Option<HttpRequest> {
    if let Err(e) = store.remove(&msg.path).await {
        warn!(path = %msg.path, "Failed to delete consumed request: {e}");
    }
    let req_id = msg
        .value
        .get("reqId")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    match codec::decode::<HttpRequest>(msg.value) {
        Ok(req) => Some(req),
        Err(e) => {
            warn!(key = %msg.key, "Dropping malformed request: {e}");
            if let Some(req_id) = req_id {
                let output = msg.path.rsplit_once("/input/").map(|(root, _)| format!("{root}/output"));
                if let Some(output) = output {
                    let resp = HttpResponse::upstream_error(&req_id, 400, "malformed request");
                    let pushed = match codec::encode(&resp) {
                        Ok(value) => store.push(&output, value).await.map(|_| ()),
                        Err(e) => Err(StoreError::Protocol(e.to_string())),
                    };
                    if let Err(e) = pushed {
                        warn!(req_id = %req_id, "Failed to push 400 response: {e}");
                    }
                }
            }
            None
        }
    }
}

impl Forwarder {
    fn new(store: SharedStore, paths: SessionPaths, config: &HttpConfig, pinned_port: Option<u16>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            store,
            paths,
            client,
            local_host: config.local_host.clone(),
            pinned_port,
            mode: config.response_mode,
            upstream_timeout: config.upstream_timeout(),
        }
    }

    async fn push_response(&self, resp: &HttpResponse) {
        match codec::encode(resp) {
            Ok(value) => {
                if let Err(e) = self.store.push(&self.paths.output(), value).await {
                    warn!(req_id = %resp.req_id, "Failed to push response: {e}");
                }
            }
            Err(e) => warn!(req_id = %resp.req_id, "Failed to encode response: {e}"),
        }
    }

    async fn push_frame(&self, stream_path: &str, frame: &StreamFrame) -> bool {
        let Ok(value) = codec::encode(frame) else {
            return false;
        };
        match self.store.push(stream_path, value).await {
            Ok(_) => true,
            Err(e) => {
                warn!(path = stream_path, "Failed to push stream frame: {e}");
                false
            }
        }
    }

    fn build_request(&self, req: &HttpRequest) -> Result<Request<Full<Bytes>>, String> {
        let port = self.pinned_port.unwrap_or(req.port);
        let uri: Uri = format!("http://{}:{}{}", self.local_host, port, normalize_uri(&req.uri))
            .parse()
            .map_err(|e| format!("invalid uri '{}': {e}", req.uri))?;
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|e| format!("invalid method '{}': {e}", req.method))?;
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(req.body.as_bytes().to_vec())))
            .map_err(|e| e.to_string())?;
        *request.headers_mut() = codec::headers_to_http(&req.headers);
        Ok(request)
    }

    async fn handle(&self, req: HttpRequest) {
        let request = match self.build_request(&req) {
            Ok(r) => r,
            Err(e) => {
                self.push_response(&HttpResponse::upstream_error(&req.req_id, 400, &e))
                    .await;
                return;
            }
        };
        debug!(method = %req.method, uri = %req.uri, "Forwarding request");

        let response = match tokio::time::timeout(self.upstream_timeout, self.client.request(request)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!("Upstream request failed: {e}");
                let msg = upstream_error_message(&e);
                self.push_response(&HttpResponse::upstream_error(&req.req_id, 502, &msg))
                    .await;
                return;
            }
            Err(_) => {
                self.push_response(&HttpResponse::upstream_error(
                    &req.req_id,
                    504,
                    "upstream did not respond in time",
                ))
                .await;
                return;
            }
        };

        let status = response.status().as_u16();
        let headers = codec::headers_from_http(response.headers());
        let streamed = should_stream(self.mode, response.headers());
        let mut body = response.into_body();

        if !streamed {
            let collected = tokio::time::timeout(self.upstream_timeout, body.collect()).await;
            let resp = match collected {
                Ok(Ok(c)) => HttpResponse {
                    req_id: req.req_id.clone(),
                    kind: None,
                    status,
                    headers,
                    body: Payload(c.to_bytes().to_vec()),
                },
                Ok(Err(e)) => HttpResponse::upstream_error(&req.req_id, 502, &e.to_string()),
                Err(_) => HttpResponse::upstream_error(&req.req_id, 504, "upstream body timed out"),
            };
            self.push_response(&resp).await;
            return;
        }

        self.push_response(&HttpResponse {
            req_id: req.req_id.clone(),
            kind: Some(ResponseKind::Start),
            status,
            headers,
            body: Payload::default(),
        })
        .await;

        let stream_path = self.paths.stream(&req.req_id);
        let mut error = None;
        loop {
            match body.frame().await {
                None => break,
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else { continue };
                    if data.is_empty() {
                        continue;
                    }
                    let chunk = StreamFrame::Chunk {
                        body: Payload(data.to_vec()),
                    };
                    if !self.push_frame(&stream_path, &chunk).await {
                        error = Some("failed to relay chunk".to_string());
                        break;
                    }
                }
                Some(Err(e)) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        if let Some(e) = &error {
            warn!("Streamed response ended with error: {e}");
        }
        self.push_frame(&stream_path, &StreamFrame::End { error }).await;
    }
}

/// Whether a response is shipped as start + chunks + end.
fn should_stream(mode: ResponseMode, headers: &HeaderMap) -> bool {
    match mode {
        ResponseMode::Buffered => false,
        ResponseMode::Streamed => true,
        ResponseMode::Auto => {
            let event_stream = headers
                .get(axum::http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("text/event-stream"));
            event_stream || !headers.contains_key(axum::http::header::CONTENT_LENGTH)
        }
    }
}

fn normalize_uri(uri: &str) -> String {
    if uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("/{uri}")
    }
}

/// Describe a client error by its innermost cause ("Connection refused").
fn upstream_error_message(e: &hyper_util::client::legacy::Error) -> String {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(e);
    let mut message = e.to_string();
    while let Some(inner) = source {
        message = inner.to_string();
        source = inner.source();
    }
    message
}
