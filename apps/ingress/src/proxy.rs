use std::{convert::Infallible, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Backend, ProxyConfig};
use crate::error::ProxyError;
use crate::routing::{extract_host, parse_route, resolve, Route, RouteTarget};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;
type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub const PROXIED_HEADER: &str = "x-fabric-proxied";
pub const WORKSPACE_HEADER: &str = "x-fabric-workspace";
pub const PORT_HEADER: &str = "x-fabric-port";

struct AppState {
    client: HttpClient,
    backend: RwLock<Arc<Backend>>,
    provider_suffix: Option<String>,
    workspace_suffix: Option<String>,
}

pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    state: Arc<AppState>,
}

impl ProxyHandle {
    pub fn backend(&self) -> Arc<Backend> {
        self.state.backend.read().clone()
    }

    /// Probe `health_url` and switch to `backend` only if it answers 2xx.
    ///
    /// Requests already in flight finish against the backend they started with.
    pub async fn swap_backend(&self, backend: Backend, health_url: &str) -> Result<(), ProxyError> {
        let uri = Uri::from_str(health_url)
            .map_err(|e| ProxyError::HealthCheck(format!("invalid health url {health_url}: {e}")))?;
        let request = Request::get(uri)
            .body(empty_body())
            .map_err(|e| ProxyError::HealthCheck(e.to_string()))?;
        let response = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.state.client.request(request))
            .await
            .map_err(|_| ProxyError::HealthCheck(format!("{health_url} timed out")))?
            .map_err(|e| ProxyError::HealthCheck(e.to_string()))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), %health_url, "backend swap rejected");
            return Err(ProxyError::UnhealthyBackend(response.status()));
        }

        let backend = backend.normalized();
        info!(scheme = %backend.scheme, host_override = ?backend.host_override, "backend swapped");
        *self.state.backend.write() = Arc::new(backend);
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn build_client() -> HttpClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(8)
        .build(https)
}

/// Bind and start serving. Fails on an invalid configuration before accepting anything.
pub async fn spawn_proxy(config: ProxyConfig) -> Result<ProxyHandle, ProxyError> {
    let config = config.normalized()?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    let state = Arc::new(AppState {
        client: build_client(),
        backend: RwLock::new(Arc::new(config.backend)),
        provider_suffix: config.provider_domain_suffix,
        workspace_suffix: config.workspace_domain_suffix,
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let accept_state = state.clone();
    let task = tokio::spawn(async move {
        info!("ingress listening on {}", addr);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let state = accept_state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_connection(stream, remote_addr, state).await {
                                    debug!(%err, client = %remote_addr, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(%e, "accept error");
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("shutting down ingress");
                    break;
                }
            }
        }
    });

    Ok(ProxyHandle {
        addr,
        shutdown: Some(shutdown_tx),
        task,
        state,
    })
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<(), BoxError> {
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(state, remote_addr, req).await) }
    });
    let builder = auto::Builder::new(TokioExecutor::new());
    builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
}

async fn handle_request(
    state: Arc<AppState>,
    remote_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let host = extract_host(req.headers());
    let route = host.as_deref().and_then(|host| {
        parse_route(
            host,
            state.provider_suffix.as_deref(),
            state.workspace_suffix.as_deref(),
        )
    });
    let Some(route) = route else {
        return local_response(&req, host.as_deref());
    };

    if is_loop(req.headers()) {
        warn!(client = %remote_addr, host = ?host, "proxy loop detected");
        return text_response(StatusCode::LOOP_DETECTED, "loop detected");
    }

    // Snapshot so a concurrent swap cannot change the backend mid-request.
    let backend = state.backend.read().clone();
    let Some(target) = resolve(&route, &backend) else {
        debug!(host = ?host, "route did not resolve");
        return not_found();
    };

    if is_upgrade_request(&req) {
        handle_upgrade(&state.client, remote_addr, &route, target, req).await
    } else {
        forward_http(&state.client, remote_addr, &route, target, req).await
    }
}

fn local_response(req: &Request<Incoming>, host: Option<&str>) -> Response<BoxBody> {
    if req.method() == Method::GET {
        match req.uri().path() {
            "/health" => {
                return json_response(
                    StatusCode::OK,
                    json!({
                        "status": "healthy",
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    }),
                )
            }
            "/version" => {
                return json_response(
                    StatusCode::OK,
                    json!({
                        "version": VERSION,
                        "git_commit": GIT_COMMIT,
                    }),
                )
            }
            _ => {}
        }
    }
    debug!(host = ?host, path = %req.uri().path(), "no route for host");
    not_found()
}

async fn forward_http(
    client: &HttpClient,
    remote_addr: SocketAddr,
    route: &Route,
    target: RouteTarget,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let (mut parts, incoming) = req.into_parts();
    parts.uri = match build_upstream_uri(&target, &parts.uri) {
        Ok(uri) => uri,
        Err(resp) => return resp,
    };
    parts.version = Version::HTTP_11;
    strip_hop_by_hop_headers(&mut parts.headers);
    apply_forward_headers(&mut parts.headers, route, &target);

    info!(
        client = %remote_addr,
        method = %parts.method,
        path = %parts.uri.path(),
        upstream = %target.authority(),
        "proxy http"
    );

    let upstream_req = Request::from_parts(parts, incoming_to_box(incoming));
    let upstream_resp = match client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(%err, upstream = %target.authority(), "upstream request failed");
            return bad_gateway();
        }
    };

    let (mut parts, body) = upstream_resp.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    let mut resp = Response::new(incoming_to_box(body));
    *resp.status_mut() = parts.status;
    *resp.headers_mut() = parts.headers;
    resp
}

async fn handle_upgrade(
    client: &HttpClient,
    remote_addr: SocketAddr,
    route: &Route,
    target: RouteTarget,
    mut req: Request<Incoming>,
) -> Response<BoxBody> {
    let client_upgrade = hyper::upgrade::on(&mut req);
    let (mut parts, incoming) = req.into_parts();
    parts.uri = match build_upstream_uri(&target, &parts.uri) {
        Ok(uri) => uri,
        Err(resp) => return resp,
    };
    parts.version = Version::HTTP_11;
    // Connection and Upgrade stay; the backend needs them.
    for name in [
        "proxy-connection",
        "keep-alive",
        "te",
        "transfer-encoding",
        "trailers",
    ] {
        parts.headers.remove(name);
    }
    apply_forward_headers(&mut parts.headers, route, &target);

    info!(client = %remote_addr, upstream = %target.authority(), "proxy upgrade");

    let upstream_req = Request::from_parts(parts, incoming_to_box(incoming));
    let upstream_resp = match client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(%err, upstream = %target.authority(), "upstream upgrade failed");
            return bad_gateway();
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, body) = upstream_resp.into_parts();
        let mut resp = Response::new(incoming_to_box(body));
        *resp.status_mut() = parts.status;
        *resp.headers_mut() = parts.headers;
        return resp;
    }

    let mut client_resp = Response::new(empty_body());
    *client_resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *client_resp.headers_mut() = upstream_resp.headers().clone();
    client_resp
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));

    tokio::spawn(async move {
        match future::try_join(client_upgrade, hyper::upgrade::on(upstream_resp)).await {
            Ok((client_upgraded, upstream_upgraded)) => {
                let mut client_io = TokioIo::new(client_upgraded);
                let mut upstream_io = TokioIo::new(upstream_upgraded);
                if let Err(e) = copy_bidirectional(&mut client_io, &mut upstream_io).await {
                    debug!(%e, "upgrade tunnel closed with error");
                }
                let _ = client_io.shutdown().await;
                let _ = upstream_io.shutdown().await;
            }
            Err(e) => {
                warn!(%e, "upgrade error");
            }
        }
    });

    client_resp
}

fn is_loop(headers: &HeaderMap) -> bool {
    headers
        .get(PROXIED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_conn_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_conn_upgrade && req.headers().contains_key(UPGRADE)
}

fn apply_forward_headers(headers: &mut HeaderMap, route: &Route, target: &RouteTarget) {
    if let Ok(value) = HeaderValue::from_str(&target.authority()) {
        headers.insert(HOST, value);
    }
    headers.insert(PROXIED_HEADER, HeaderValue::from_static("true"));
    headers.remove(WORKSPACE_HEADER);
    headers.remove(PORT_HEADER);
    if let Route::Workspace { workspace, port } = route {
        if let Ok(value) = HeaderValue::from_str(workspace) {
            headers.insert(WORKSPACE_HEADER, value);
        }
        headers.insert(PORT_HEADER, HeaderValue::from(*port));
    }
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Names listed in Connection are hop-by-hop too.
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }

    const HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
        "proxy-connection",
    ];
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

fn build_upstream_uri(target: &RouteTarget, orig: &Uri) -> Result<Uri, Response<BoxBody>> {
    let path_and_query = orig.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri = format!(
        "{}://{}{}",
        target.scheme.as_str(),
        target.authority(),
        path_and_query
    );
    Uri::from_str(&uri).map_err(|_| bad_gateway())
}

fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn full_body(b: impl Into<Bytes>) -> BoxBody {
    Full::new(b.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn incoming_to_box(b: Incoming) -> BoxBody {
    b.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

fn text_response(status: StatusCode, msg: &'static str) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(msg));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn json_response(status: StatusCode, value: Value) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(value.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn not_found() -> Response<BoxBody> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

fn bad_gateway() -> Response<BoxBody> {
    text_response(StatusCode::BAD_GATEWAY, "bad gateway")
}
