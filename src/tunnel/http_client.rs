//! Client side of the HTTP tunnel: a local HTTP proxy.
//!
//! Every request to the proxy becomes one message on
//! `sessions/{id}/http/input`. A single dispatcher task consumes `output`,
//! deletes each message and hands it to the waiting request through the
//! [`PendingTable`]. Routing is by path: `/{port}/{rest}` forwards `/{rest}`
//! to `port` on the server side, unless a fixed port is configured.
//!
//! | Outcome                                    | Local response |
//! |--------------------------------------------|----------------|
//! | malformed port segment                     | 400            |
//! | request body over `max_request_body`       | 413            |
//! | request message could not be written       | 500            |
//! | no first response within `initial_timeout` | 504            |
//! | streamed body not started within `stream_timeout` | 504     |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::channel::mpsc as body_mpsc;
use futures::SinkExt;
use hyper::body::Bytes;
use serde_json::Map;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::pending::{new_req_id, PendingTable};
use crate::codec::{self, ClientInfo, HttpRequest, HttpResponse, Payload, StreamFrame};
use crate::config::HttpConfig;
use crate::error::StoreError;
use crate::sessions::{self, Feature, SessionPaths};
use crate::store::{SharedStore, Store, Subscription};

/// Shared state of one proxy.
pub struct ProxyState {
    store: SharedStore,
    paths: SessionPaths,
    pending: PendingTable,
    fixed_port: Option<u16>,
    initial_timeout: Duration,
    stream_timeout: Duration,
    max_request_body: usize,
}

/// A running proxy for one session: state plus the output dispatcher.
pub struct HttpProxy {
    state: Arc<ProxyState>,
    dispatcher: JoinHandle<()>,
}

impl HttpProxy {
    /// Announce the client and start consuming `output`.
    pub async fn start(
        store: SharedStore,
        session_id: &str,
        config: &HttpConfig,
    ) -> Result<Self, StoreError> {
        let paths = SessionPaths::new(session_id, Feature::Http);
        sessions::announce_client(&*store, &paths, Map::new()).await?;
        let output = store.subscribe(&paths.output()).await?;

        let state = Arc::new(ProxyState {
            store,
            paths,
            pending: PendingTable::new(),
            fixed_port: config.fixed_port,
            initial_timeout: config.initial_timeout(),
            stream_timeout: config.stream_timeout(),
            max_request_body: config.max_request_body,
        });
        let dispatcher = tokio::spawn(dispatch(state.clone(), output));
        Ok(Self { state, dispatcher })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve the proxy on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: tokio::net::TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Consume `output`: delete every message, deliver the ones somebody waits for.
async fn dispatch(state: Arc<ProxyState>, mut output: Subscription) {
    while let Some(child) = output.next().await {
        if let Err(e) = state.store.remove(&child.path).await {
            warn!(path = %child.path, "Failed to delete consumed response: {e}");
        }
        match codec::decode::<HttpResponse>(child.value) {
            Ok(resp) => {
                let req_id = resp.req_id.clone();
                if !state.pending.resolve(resp).await {
                    debug!(req_id = %req_id, "Discarded response with no waiting request");
                }
            }
            Err(e) => warn!(key = %child.key, "Dropping malformed response: {e}"),
        }
    }
    warn!("Output subscription ended; proxy can no longer receive responses");
}

/// Split a proxied path into `(port, forwarded uri)`.
///
/// `/8080/api?x=1` → `(8080, "/api?x=1")`; with a fixed port the whole path is
/// forwarded unchanged.
pub fn route_target(path_and_query: &str, fixed_port: Option<u16>) -> Result<(u16, String), String> {
    if let Some(port) = fixed_port {
        let uri = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        return Ok((port, uri));
    }

    let trimmed = path_and_query.trim_start_matches('/');
    let end = trimmed.find(['/', '?']).unwrap_or(trimmed.len());
    let (segment, rest) = trimmed.split_at(end);
    let port = segment
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| format!("Invalid port '{segment}' in path; expected /{{port}}/..."))?;
    let uri = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    };
    Ok((port, uri))
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body.into(),
    )
        .into_response()
}

async fn proxy(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string());
    let (port, uri) = match route_target(&path_and_query, state.fixed_port) {
        Ok(t) => t,
        Err(e) => return plain(StatusCode::BAD_REQUEST, e),
    };

    let client_info = ClientInfo {
        ip: req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string()),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    let method = req.method().to_string();
    let headers = codec::headers_from_http(req.headers());
    let body = match axum::body::to_bytes(req.into_body(), state.max_request_body).await {
        Ok(b) => b,
        Err(e) => return plain(StatusCode::PAYLOAD_TOO_LARGE, format!("Error: {e}")),
    };

    let req_id = new_req_id();
    let message = HttpRequest {
        req_id: req_id.clone(),
        port,
        method,
        uri,
        headers,
        body: Payload(body.to_vec()),
        client_info: Some(client_info),
    };

    let waiter = state.pending.register(&req_id).await;
    let pushed = match codec::encode(&message) {
        Ok(value) => state.store.push(&state.paths.input(), value).await.map(|_| ()),
        Err(e) => Err(StoreError::Protocol(e.to_string())),
    };
    if let Err(e) = pushed {
        state.pending.cancel(&req_id).await;
        warn!(req_id = %req_id, "Failed to send request: {e}");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"));
    }
    debug!(req_id = %req_id, port, uri = %message.uri, "Request sent");

    let first = match tokio::time::timeout(state.initial_timeout, waiter).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(_)) => {
            return plain(StatusCode::BAD_GATEWAY, "Error: tunnel closed");
        }
        Err(_) => {
            state.pending.cancel(&req_id).await;
            info!(req_id = %req_id, "Timed out waiting for initial response");
            return plain(StatusCode::GATEWAY_TIMEOUT, "timeout waiting for initial response");
        }
    };

    if first.is_start() {
        return stream_response(&state, first).await;
    }
    build_response(first.status, &first.headers, Body::from(first.body.into_bytes()))
}

fn build_response(status: u16, headers: &codec::Headers, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = codec::headers_to_http(headers);
    response
}

/// Read the next frame before `deadline`, deleting it from the stream mailbox.
async fn next_frame(
    store: &dyn Store,
    frames: &mut Subscription,
    deadline: Instant,
) -> Result<Option<StreamFrame>, ()> {
    loop {
        let child = match tokio::time::timeout_at(deadline, frames.next()).await {
            Ok(Some(child)) => child,
            Ok(None) => return Ok(None),
            Err(_) => return Err(()),
        };
        if let Err(e) = store.remove(&child.path).await {
            warn!(path = %child.path, "Failed to delete consumed frame: {e}");
        }
        match codec::decode::<StreamFrame>(child.value) {
            Ok(frame) => return Ok(Some(frame)),
            Err(e) => warn!(key = %child.key, "Dropping malformed stream frame: {e}"),
        }
    }
}

async fn stream_response(state: &Arc<ProxyState>, start: HttpResponse) -> Response {
    let req_id = start.req_id.clone();
    let stream_path = state.paths.stream(&req_id);
    let deadline = Instant::now() + state.stream_timeout;

    let mut frames = match state.store.subscribe(&stream_path).await {
        Ok(s) => s,
        Err(e) => return plain(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")),
    };

    let first = next_frame(&*state.store, &mut frames, deadline).await;
    let first_chunk = match first {
        Ok(Some(StreamFrame::Chunk { body })) => body.into_bytes(),
        Ok(Some(StreamFrame::End { error: None })) => {
            finish_stream(&*state.store, frames, &stream_path).await;
            return build_response(start.status, &start.headers, Body::empty());
        }
        Ok(Some(StreamFrame::End { error: Some(e) })) => {
            finish_stream(&*state.store, frames, &stream_path).await;
            return plain(StatusCode::BAD_GATEWAY, format!("Error: {e}"));
        }
        Ok(None) => {
            finish_stream(&*state.store, frames, &stream_path).await;
            return plain(StatusCode::BAD_GATEWAY, "Error: stream closed");
        }
        Err(()) => {
            finish_stream(&*state.store, frames, &stream_path).await;
            info!(req_id = %req_id, "Stream did not complete in time");
            return plain(StatusCode::GATEWAY_TIMEOUT, "stream did not complete");
        }
    };

    let (mut tx, rx) = body_mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let pump_state = state.clone();
    tokio::spawn(async move {
        let store = &*pump_state.store;
        if tx.send(Ok(Bytes::from(first_chunk))).await.is_err() {
            finish_stream(store, frames, &stream_path).await;
            return;
        }
        loop {
            let item = match next_frame(store, &mut frames, deadline).await {
                Ok(Some(StreamFrame::Chunk { body })) => Ok(Bytes::from(body.into_bytes())),
                Ok(Some(StreamFrame::End { error: None })) => break,
                Ok(Some(StreamFrame::End { error: Some(e) })) => Err(std::io::Error::other(e)),
                Ok(None) => Err(std::io::Error::other("stream closed")),
                Err(()) => {
                    info!(req_id = %req_id, "Stream did not complete in time");
                    Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "stream did not complete",
                    ))
                }
            };
            let last = item.is_err();
            // Caller hung up: stop relaying.
            if tx.send(item).await.is_err() || last {
                break;
            }
        }
        finish_stream(store, frames, &stream_path).await;
    });

    build_response(start.status, &start.headers, Body::from_stream(rx))
}

/// Detach from a stream mailbox and delete whatever is left in it.
async fn finish_stream(store: &dyn Store, frames: Subscription, stream_path: &str) {
    drop(frames);
    if let Err(e) = store.remove(stream_path).await {
        warn!(path = stream_path, "Failed to remove stream data: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Headers, ResponseKind};
    use crate::config::Config;
    use crate::store::MemoryStore;
    use crate::tunnel::{http_server, StopReason, StopSignal, Worker};
    use axum::routing::{get, post};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn http_config(initial_ms: u64, stream_ms: u64) -> HttpConfig {
        HttpConfig {
            initial_timeout_ms: initial_ms,
            stream_timeout_ms: stream_ms,
            ..Config::default().http
        }
    }

    async fn send(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Take the next request message off `input`, deleting it.
    async fn take_request(store: &SharedStore, input: &mut Subscription) -> HttpRequest {
        let child = tokio::time::timeout(Duration::from_secs(5), input.next())
            .await
            .unwrap()
            .unwrap();
        store.remove(&child.path).await.unwrap();
        codec::decode(child.value).unwrap()
    }

    fn start_message(req_id: &str) -> serde_json::Value {
        codec::encode(&HttpResponse {
            req_id: req_id.into(),
            kind: Some(ResponseKind::Start),
            status: 200,
            headers: Headers::new(),
            body: Payload::default(),
        })
        .unwrap()
    }

    #[test]
    fn route_target_parses_port_prefix() {
        assert_eq!(route_target("/8080/api/x?y=1", None).unwrap(), (8080, "/api/x?y=1".into()));
        assert_eq!(route_target("/3000", None).unwrap(), (3000, "/".into()));
        assert_eq!(route_target("/3000?q", None).unwrap(), (3000, "/?q".into()));
        assert!(route_target("/abc/x", None).is_err());
        assert!(route_target("/0/x", None).is_err());
        assert!(route_target("/70000/x", None).is_err());
        assert!(route_target("/", None).is_err());
        assert_eq!(route_target("/any/path", Some(9000)).unwrap(), (9000, "/any/path".into()));
    }

    #[tokio::test]
    async fn malformed_port_is_rejected_locally() {
        let mem = Arc::new(MemoryStore::new());
        let store: SharedStore = mem.clone();
        let proxy = HttpProxy::start(store.clone(), "bad", &http_config(200, 200)).await.unwrap();
        let resp = send(&proxy.router(), "/notaport/x").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let paths = SessionPaths::new("bad", Feature::Http);
        assert!(store.get(&paths.input()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_response_times_out_with_504() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let proxy = HttpProxy::start(store.clone(), "silent", &http_config(100, 100)).await.unwrap();
        let started = std::time::Instant::now();
        let resp = send(&proxy.router(), "/8080/").await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(body_text(resp).await, "timeout waiting for initial response");
        assert_eq!(proxy.state.pending.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_requests_are_correlated_by_req_id() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let paths = SessionPaths::new("corr", Feature::Http);
        let proxy = HttpProxy::start(store.clone(), "corr", &http_config(5_000, 5_000)).await.unwrap();
        let app = proxy.router();
        let mut input = store.subscribe(&paths.input()).await.unwrap();

        let a = tokio::spawn({
            let app = app.clone();
            async move { body_text(send(&app, "/1111/a").await).await }
        });
        let first = take_request(&store, &mut input).await;
        let b = tokio::spawn({
            let app = app.clone();
            async move { body_text(send(&app, "/2222/b").await).await }
        });
        let second = take_request(&store, &mut input).await;

        // Answer in reverse order; each caller must get its own body.
        for req in [&second, &first] {
            let resp = HttpResponse {
                req_id: req.req_id.clone(),
                kind: None,
                status: 200,
                headers: Headers::new(),
                body: Payload(format!("for {}", req.uri).into_bytes()),
            };
            store.push(&paths.output(), codec::encode(&resp).unwrap()).await.unwrap();
        }
        assert_eq!(a.await.unwrap(), "for /a");
        assert_eq!(b.await.unwrap(), "for /b");

        // An orphan is still consumed.
        let orphan = HttpResponse::upstream_error("nobody", 502, "x");
        store.push(&paths.output(), codec::encode(&orphan).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&paths.output()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_timeout_returns_504_and_detaches() {
        let mem = Arc::new(MemoryStore::new());
        let store: SharedStore = mem.clone();
        let paths = SessionPaths::new("stall", Feature::Http);
        let proxy = HttpProxy::start(store.clone(), "stall", &http_config(2_000, 150)).await.unwrap();
        let app = proxy.router();
        let mut input = store.subscribe(&paths.input()).await.unwrap();

        let call = tokio::spawn(async move { send(&app, "/8080/events").await });
        let req = take_request(&store, &mut input).await;
        store.push(&paths.output(), start_message(&req.req_id)).await.unwrap();

        let resp = tokio::time::timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_text(resp).await, "stream did not complete");

        let stream_path = paths.stream(&req.req_id);
        assert_eq!(mem.subscriber_count(&stream_path), 0);
        // A frame arriving late is never read and the mailbox holds only it.
        let late = codec::encode(&StreamFrame::Chunk { body: Payload(b"late".to_vec()) }).unwrap();
        store.push(&stream_path, late).await.unwrap();
        assert_eq!(mem.subscriber_count(&stream_path), 0);
    }

    #[tokio::test]
    async fn streamed_body_arrives_complete_and_in_order() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let paths = SessionPaths::new("chunks", Feature::Http);
        let proxy = HttpProxy::start(store.clone(), "chunks", &http_config(2_000, 2_000)).await.unwrap();
        let app = proxy.router();
        let mut input = store.subscribe(&paths.input()).await.unwrap();

        let call = tokio::spawn(async move { body_text(send(&app, "/8080/s").await).await });
        let req = take_request(&store, &mut input).await;
        store.push(&paths.output(), start_message(&req.req_id)).await.unwrap();
        let stream_path = paths.stream(&req.req_id);
        for part in ["a", "b", "c", "d"] {
            let frame = StreamFrame::Chunk { body: Payload(part.as_bytes().to_vec()) };
            store.push(&stream_path, codec::encode(&frame).unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store
            .push(&stream_path, codec::encode(&StreamFrame::End { error: None }).unwrap())
            .await
            .unwrap();

        assert_eq!(call.await.unwrap(), "abcd");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&paths.streams()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_to_end_through_server_worker() {
        let upstream = Router::new()
            .route("/greet", get(|| async { "hello through the tunnel" }))
            .route("/echo", post(|body: String| async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, upstream).await.unwrap() });

        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.http.local_host = "127.0.0.1".into();
        let stop = StopSignal::new();
        let server = tokio::spawn(http_server::run(Worker {
            store: store.clone(),
            config: Arc::new(config.clone()),
            server_id: "srv".into(),
            session_id: "e2e".into(),
            instance_id: "srv_http_e2e".into(),
            port: None,
            stop: stop.clone(),
        }));

        let proxy = HttpProxy::start(store.clone(), "e2e", &config.http).await.unwrap();
        let app = proxy.router();

        let resp = send(&app, &format!("/{port}/greet")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "hello through the tunnel");

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/{port}/echo"))
                    .body(Body::from("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "ping");

        stop.stop(StopReason::Command);
        server.await.unwrap();
        let paths = SessionPaths::new("e2e", Feature::Http);
        assert!(store.get(&paths.input()).await.unwrap().is_none());
        assert!(store.get(&paths.output()).await.unwrap().is_none());
    }
}
