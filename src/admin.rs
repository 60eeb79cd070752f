//! The RESTful admin API and the websocket event endpoint.
//!
//! Everything lives under `/api`. Mutating calls drive the server pool and
//! the mount tables, and publish the matching event on the bus; `GET
//! /api/events` upgrades to a websocket and streams filtered events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};
use url::Url;

use crate::error::ApiError;
use crate::events::{Event, EventBus, EventType, FileServeEvent, MountEvent, ServerEvent};
use crate::fileserver::Params;
use crate::mount::{mount_id, sha1_hex};
use crate::server::{ManagedServer, ServerPool};

/// Query parameter carrying the comma-separated event-type codes.
pub const EVENTS_QUERY_KEY: &str = "e";

/// How long a create call waits for the new server's started barrier.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Websocket write deadline.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Websocket read deadline, re-armed by every pong.
const PONG_WAIT: Duration = Duration::from_secs(255);

fn ping_wait() -> Duration {
    PONG_WAIT * 9 / 10
}

/// Wire shape of a managed server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub bind_address: String,
    pub port: u16,
    pub mounts: Vec<Mount>,
}

/// Wire shape of a mount point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub id: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateServerRequest {
    #[serde(default)]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerMountRequest {
    pub target: String,
    pub source: String,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub fs_params: Params,
}

/// Identity of an admin route; renders the canonical path for `Location`
/// headers and the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Servers,
    Server { port: u16 },
    Mounts { port: u16 },
    Mount { port: u16, id: String },
    FileServers,
    Events,
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Route::Servers => "/api/servers".to_string(),
            Route::Server { port } => format!("/api/servers/{}", port),
            Route::Mounts { port } => format!("/api/servers/{}/mounts", port),
            Route::Mount { port, id } => format!("/api/servers/{}/mounts/{}", port, id),
            Route::FileServers => "/api/fileservers".to_string(),
            Route::Events => "/api/events".to_string(),
        }
    }

    /// The absolute URL of this route under `base`.
    pub fn url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_path(&self.path());
        url.set_query(None);
        url
    }
}

/// Binds the admin routes to the server pool and the event bus.
pub struct AdminHandler {
    pool: Arc<ServerPool>,
    bus: EventBus,
    base_url: Url,
}

impl AdminHandler {
    pub fn new(pool: Arc<ServerPool>, bus: EventBus, base_url: Url) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Accept admin connections until the shutdown channel flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "admin API listening");
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let handler = Arc::clone(&handler);
                                    async move { Ok::<_, hyper::Error>(handler.handle(req).await) }
                                });
                                // Upgrades are needed for the events endpoint.
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("admin API shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "admin request");

        // The events endpoint consumes the whole request for the upgrade.
        if path == "/api/events" {
            return self
                .handle_events(req)
                .await
                .unwrap_or_else(ApiError::into_response);
        }

        let (parts, body) = req.into_parts();
        self.dispatch(&parts, body)
            .await
            .unwrap_or_else(ApiError::into_response)
    }

    async fn dispatch(
        &self,
        parts: &Parts,
        body: Incoming,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        let path = parts.uri.path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (&parts.method, segments.as_slice()) {
            (&Method::GET, ["api", "servers"]) | (&Method::HEAD, ["api", "servers"]) => {
                self.get_servers(parts)
            }
            (&Method::POST, ["api", "servers"]) => self.create_server(parts, body, None).await,
            (&Method::DELETE, ["api", "servers"]) => self.remove_servers().await,
            (_, ["api", "servers"]) => Err(method_not_allowed()),

            (&Method::GET, ["api", "servers", port])
            | (&Method::HEAD, ["api", "servers", port]) => {
                let srv = self.server_or_404(port)?;
                self.serve_json(parts, &server_data(&srv), StatusCode::OK, None)
            }
            (&Method::PUT, ["api", "servers", port]) => {
                let port = parse_port(port)?;
                self.create_server(parts, body, Some(port)).await
            }
            (&Method::DELETE, ["api", "servers", port]) => {
                let srv = self.server_or_404(port)?;
                self.remove_server(&srv).await
            }
            (_, ["api", "servers", _]) => Err(method_not_allowed()),

            (&Method::GET, ["api", "servers", port, "mounts"])
            | (&Method::HEAD, ["api", "servers", port, "mounts"]) => {
                let srv = self.server_or_404(port)?;
                self.serve_json(parts, &mounts_data(&srv), StatusCode::OK, None)
            }
            (&Method::POST, ["api", "servers", port, "mounts"]) => {
                let srv = self.server_or_404(port)?;
                self.create_mount(parts, body, &srv).await
            }
            (&Method::DELETE, ["api", "servers", port, "mounts"]) => {
                let srv = self.server_or_404(port)?;
                self.remove_mounts(&srv).await
            }
            (_, ["api", "servers", _, "mounts"]) => Err(method_not_allowed()),

            (&Method::GET, ["api", "servers", port, "mounts", id])
            | (&Method::HEAD, ["api", "servers", port, "mounts", id]) => {
                let srv = self.server_or_404(port)?;
                let mount = mount_or_404(&srv, id)?;
                self.serve_json(parts, &mount, StatusCode::OK, None)
            }
            (&Method::DELETE, ["api", "servers", port, "mounts", id]) => {
                let srv = self.server_or_404(port)?;
                self.remove_mount(&srv, id).await
            }
            (_, ["api", "servers", _, "mounts", _]) => Err(method_not_allowed()),

            (&Method::GET, ["api", "fileservers"]) | (&Method::HEAD, ["api", "fileservers"]) => {
                self.serve_json(parts, &self.pool.registry().types(), StatusCode::OK, None)
            }
            (_, ["api", "fileservers"]) => Err(method_not_allowed()),

            _ => Err(ApiError::not_found(format!("{}: no such route", path))),
        }
    }

    fn get_servers(&self, parts: &Parts) -> Result<Response<Full<Bytes>>, ApiError> {
        let servers: Vec<Server> = self.pool.servers().iter().map(|s| server_data(s)).collect();
        self.serve_json(parts, &servers, StatusCode::OK, None)
    }

    async fn create_server(
        &self,
        parts: &Parts,
        body: Incoming,
        port: Option<u16>,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        let req: CreateServerRequest = read_json(body).await?;
        let srv = self
            .add_and_start(&req.bind_address, port.unwrap_or(0))
            .await?;
        match port {
            // Ephemeral create points at the resolved resource.
            None => self.serve_json(
                parts,
                &server_data(&srv),
                StatusCode::CREATED,
                Some(Route::Server { port: srv.port() }),
            ),
            Some(_) => self.serve_json(parts, &server_data(&srv), StatusCode::OK, None),
        }
    }

    async fn add_and_start(
        &self,
        bind_address: &str,
        port: u16,
    ) -> Result<Arc<ManagedServer>, ApiError> {
        let addr = join_host_port(bind_address, port);
        let srv = self
            .pool
            .add(&addr)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        if !self.pool.start_srv(&srv).await {
            error!(addr = %addr, "unable to start server");
            return Err(ApiError::internal(format!(
                "unable to start server on {}",
                addr
            )));
        }
        if tokio::time::timeout(START_TIMEOUT, srv.wait_started())
            .await
            .is_err()
        {
            error!(addr = %addr, "server did not start in time");
            return Err(ApiError::internal(format!(
                "server on {} did not start in time",
                addr
            )));
        }

        self.install_serve_hook(&srv);
        info!(port = srv.port(), "created server, available on http://{}", srv.addr());
        self.bus
            .publish(Event::ServerAdd(ServerEvent {
                server: server_data(&srv),
            }))
            .await;
        Ok(srv)
    }

    /// Wire the per-request observer: log the serve and publish a
    /// `FileServe` event carrying a snapshot of the server.
    fn install_serve_hook(&self, srv: &Arc<ManagedServer>) {
        let bus = self.bus.clone();
        let weak = Arc::downgrade(srv);
        srv.set_serve_hook(Arc::new(move |path, status| {
            let srv = match weak.upgrade() {
                Some(srv) => srv,
                None => return,
            };
            info!(port = srv.port(), code = status.as_u16(), path, "served");
            let event = Event::FileServe(FileServeEvent {
                server: server_data(&srv),
                path: path.to_string(),
                code: status.as_u16(),
            });
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(event).await });
        }));
    }

    async fn remove_servers(&self) -> Result<Response<Full<Bytes>>, ApiError> {
        let mut failures = Vec::new();
        for srv in self.pool.servers() {
            let port = srv.port();
            let snapshot = server_data(&srv);
            match self.pool.remove(port).await {
                Ok(true) => {
                    info!(port, "server shut down");
                    self.bus
                        .publish(Event::ServerRemove(ServerEvent { server: snapshot }))
                        .await;
                }
                Ok(false) => {
                    failures.push(format!("unable to shut down server on port {}", port));
                }
                Err(e) => {
                    error!(port, error = %e, "error shutting down server");
                    failures.push(e.to_string());
                }
            }
        }
        if !failures.is_empty() {
            return Err(ApiError::internal(failures.join("\n")));
        }
        Ok(empty_ok())
    }

    async fn remove_server(
        &self,
        srv: &Arc<ManagedServer>,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        let port = srv.port();
        let snapshot = server_data(srv);
        match self.pool.remove(port).await {
            Ok(true) => {
                info!(port, "server shut down");
                self.bus
                    .publish(Event::ServerRemove(ServerEvent { server: snapshot }))
                    .await;
                Ok(empty_ok())
            }
            Ok(false) => Err(ApiError::internal(format!(
                "unable to shut down server on port {}",
                port
            ))),
            Err(e) => Err(ApiError::internal(e.to_string())),
        }
    }

    async fn create_mount(
        &self,
        parts: &Parts,
        body: Incoming,
        srv: &Arc<ManagedServer>,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        let req: CreateServerMountRequest = read_json(body).await?;
        let existed = srv
            .mounts()
            .put(&req.target, &req.source, &req.fs_type, &req.fs_params)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;

        let mount = Mount {
            id: mount_id(&req.target),
            source: srv.mounts().source_of(&req.target),
            target: req.target.clone(),
        };
        let event_resource = MountEvent {
            server: server_data(srv),
            mount: mount.clone(),
        };
        if existed {
            info!(
                port = srv.port(),
                mount = %mount.id,
                "updated mount point: {} on http://{}{}",
                mount.source,
                srv.addr(),
                mount.target
            );
            self.bus.publish(Event::MountUpdate(event_resource)).await;
        } else {
            info!(
                port = srv.port(),
                mount = %mount.id,
                "created mount point: {} on http://{}{}",
                mount.source,
                srv.addr(),
                mount.target
            );
            self.bus.publish(Event::MountAdd(event_resource)).await;
        }

        let location = Route::Mount {
            port: srv.port(),
            id: mount.id.clone(),
        };
        self.serve_json(parts, &mount, StatusCode::CREATED, Some(location))
    }

    async fn remove_mounts(
        &self,
        srv: &Arc<ManagedServer>,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        for target in srv.mounts().targets() {
            let mount = Mount {
                id: mount_id(&target),
                source: srv.mounts().source_of(&target),
                target: target.clone(),
            };
            if srv.mounts().delete_target(&target) {
                info!(port = srv.port(), mount = %mount.id, "removed mount point");
                self.bus
                    .publish(Event::MountRemove(MountEvent {
                        server: server_data(srv),
                        mount,
                    }))
                    .await;
            }
        }
        Ok(empty_ok())
    }

    async fn remove_mount(
        &self,
        srv: &Arc<ManagedServer>,
        id: &str,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        let mount = mount_or_404(srv, id)?;
        if !srv.mounts().delete_target(&mount.target) {
            return Err(ApiError::not_found(format!(
                "server {} has no mount {:?}",
                srv.port(),
                id
            )));
        }
        info!(port = srv.port(), mount = %id, "removed mount point");
        self.bus
            .publish(Event::MountRemove(MountEvent {
                server: server_data(srv),
                mount,
            }))
            .await;
        Ok(empty_ok())
    }

    async fn handle_events(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        if req.method() != Method::GET {
            return Err(method_not_allowed());
        }
        let filter = parse_event_filter(req.uri().query())?;
        let key = req
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("not a websocket handshake"))?;
        let accept = derive_accept_key(key.as_bytes());

        let (sink_id, rx) = self.bus.subscribe(filter).await;
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    run_sink_connection(ws, rx).await;
                }
                Err(e) => {
                    error!(error = %e, "websocket upgrade failed");
                }
            }
            bus.unsubscribe(sink_id).await;
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .body(Full::new(Bytes::new()))
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    fn server_or_404(&self, port: &str) -> Result<Arc<ManagedServer>, ApiError> {
        let port = parse_port(port)?;
        self.pool
            .get(port)
            .ok_or_else(|| ApiError::not_found(format!("server {} not found", port)))
    }

    /// Serialize `data`, stamping an ETag over the body and honoring
    /// `If-None-Match` on reads.
    fn serve_json<T: Serialize>(
        &self,
        parts: &Parts,
        data: &T,
        status: StatusCode,
        location: Option<Route>,
    ) -> Result<Response<Full<Bytes>>, ApiError> {
        let body = serde_json::to_vec_pretty(data)
            .map_err(|e| ApiError::internal(format!("error encoding response: {}", e)))?;
        let etag = format!("\"{}\"", &sha1_hex(&body)[..18]);

        if status == StatusCode::OK
            && (parts.method == Method::GET || parts.method == Method::HEAD)
        {
            let inm = parts
                .headers
                .get(header::IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok());
            if let Some(inm) = inm {
                if inm == etag || inm == "*" {
                    return Response::builder()
                        .status(StatusCode::NOT_MODIFIED)
                        .header(header::ETAG, etag)
                        .body(Full::new(Bytes::new()))
                        .map_err(|e| ApiError::internal(e.to_string()));
                }
            }
        }

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .header(header::ETAG, etag);
        if let Some(route) = location {
            builder = builder.header(header::LOCATION, route.url(&self.base_url).to_string());
        }
        let payload = if parts.method == Method::HEAD {
            Bytes::new()
        } else {
            Bytes::from(body)
        };
        builder
            .body(Full::new(payload))
            .map_err(|e| ApiError::internal(e.to_string()))
    }
}

/// Forward bus events to the websocket as JSON text frames, ping on a
/// timer, and bail out when the peer stops ponging or the sink channel
/// closes.
async fn run_sink_connection<S>(ws: WebSocketStream<S>, mut rx: mpsc::Receiver<Event>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_wait(), ping_wait());
    let mut read_deadline = Instant::now() + PONG_WAIT;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    match tokio::time::timeout(WRITE_WAIT, ws_tx.send(Message::Text(payload))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    // Unsubscribed; say goodbye and quit.
                    let _ = tokio::time::timeout(WRITE_WAIT, ws_tx.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_WAIT, ws_tx.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Pong(_))) => {
                    read_deadline = Instant::now() + PONG_WAIT;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = tokio::time::sleep_until(read_deadline) => break,
        }
    }
}

/// Snapshot of a managed server in its wire shape.
pub(crate) fn server_data(srv: &ManagedServer) -> Server {
    Server {
        bind_address: split_host(&srv.addr()),
        port: srv.port(),
        mounts: mounts_data(srv),
    }
}

fn mounts_data(srv: &ManagedServer) -> Vec<Mount> {
    let table = srv.mounts();
    let mut mounts: Vec<Mount> = table
        .targets()
        .into_iter()
        .map(|target| Mount {
            id: mount_id(&target),
            source: table.source_of(&target),
            target,
        })
        .collect();
    // Deterministic order keeps listings and their ETags stable.
    mounts.sort_by(|a, b| a.target.cmp(&b.target));
    mounts
}

fn mount_or_404(srv: &Arc<ManagedServer>, id: &str) -> Result<Mount, ApiError> {
    let err = || ApiError::not_found(format!("server {} has no mount {:?}", srv.port(), id));
    if id.len() != 7
        || !id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(err());
    }
    let table = srv.mounts();
    let target = table
        .targets()
        .into_iter()
        .find(|target| mount_id(target) == id)
        .ok_or_else(err)?;
    let source = table.source_of(&target);
    if source.is_empty() {
        return Err(err());
    }
    Ok(Mount {
        id: id.to_string(),
        source,
        target,
    })
}

fn parse_port(raw: &str) -> Result<u16, ApiError> {
    if raw.is_empty() || raw.len() > 5 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::not_found(format!("{:?}: no such route", raw)));
    }
    raw.parse::<u16>()
        .map_err(|e| ApiError::bad_request(format!("error parsing port: {}", e)))
}

fn parse_event_filter(query: Option<&str>) -> Result<HashSet<EventType>, ApiError> {
    let raw = query
        .and_then(|q| {
            q.split('&').find_map(|pair| {
                pair.strip_prefix(EVENTS_QUERY_KEY)
                    .and_then(|rest| rest.strip_prefix('='))
            })
        })
        .unwrap_or_default();
    if raw.is_empty() {
        return Ok(EventType::all());
    }
    let mut filter = HashSet::new();
    for code in raw.split(',') {
        let code: u8 = code
            .trim()
            .parse()
            .map_err(|e| ApiError::bad_request(format!("error parsing event type: {}", e)))?;
        // Codes outside the known range simply never match.
        if let Some(event_type) = EventType::from_code(code) {
            filter.insert(event_type);
        }
    }
    Ok(filter)
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn split_host(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string(),
        None => addr.to_string(),
    }
}

fn method_not_allowed() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn empty_ok() -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::new()))
}

async fn read_json<T: serde::de::DeserializeOwned>(body: Incoming) -> Result<T, ApiError> {
    let bytes = body
        .collect()
        .await
        .map_err(|e| ApiError::bad_request(format!("error reading request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::bad_request(format!("error decoding request body: {}", e)))
}
