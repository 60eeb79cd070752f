//! Managed servers and the pool that owns them.
//!
//! A [`ManagedServer`] is one bound TCP listener serving its own mount
//! table. The [`ServerPool`] keeps servers in insertion order, keyed by
//! their resolved port, and runs them through a start channel consumed by
//! [`ServerPool::listen`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::fileserver::{FileRequest, Registry};
use crate::listener::ConnTracker;
use crate::mount::MountTable;

/// How long a close waits for in-flight connections before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observer invoked after each request a managed server handles, with the
/// original request path and the response status.
pub type ServeHook = Arc<dyn Fn(&str, StatusCode) + Send + Sync>;

/// One bound TCP listener plus its mount table and connection tracking.
pub struct ManagedServer {
    /// The configured bind address, replaced by the resolved `host:port`
    /// once the listener is bound.
    addr: Mutex<String>,
    port: AtomicU16,
    running: AtomicBool,
    started_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    mounts: MountTable,
    tracker: Arc<ConnTracker>,
    serve_hook: Mutex<Option<ServeHook>>,
}

impl ManagedServer {
    pub fn new(addr: &str, registry: Arc<Registry>) -> Arc<Self> {
        let (started_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            addr: Mutex::new(addr.to_string()),
            port: AtomicU16::new(0),
            running: AtomicBool::new(false),
            started_tx,
            done_tx,
            mounts: MountTable::new(registry),
            tracker: ConnTracker::new(),
            serve_hook: Mutex::new(None),
        })
    }

    /// The bind address; `host:port` with the resolved port once started.
    pub fn addr(&self) -> String {
        self.addr.lock().clone()
    }

    /// The resolved port; 0 until the listener is bound.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Install the per-request observer. The admin layer uses this to log
    /// serves and emit events without the core depending on the bus.
    pub fn set_serve_hook(&self, hook: ServeHook) {
        *self.serve_hook.lock() = Some(hook);
    }

    /// Wait until the server has bound its listener and resolved its port.
    pub async fn wait_started(&self) {
        let mut rx = self.started_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Bind the listener, resolve the port, signal the started barrier and
    /// accept connections until [`close`](Self::close) is called.
    pub async fn listen_and_serve(self: Arc<Self>) -> anyhow::Result<()> {
        let bind_addr = self.addr();
        let listener = TcpListener::bind(&bind_addr).await?;
        let local: SocketAddr = listener.local_addr()?;
        *self.addr.lock() = local.to_string();
        self.port.store(local.port(), Ordering::SeqCst);

        let mut shutdown_rx = self.tracker.subscribe();
        self.running.store(true, Ordering::SeqCst);
        let _ = self.started_tx.send(true);
        debug!(addr = %local, "server accepting connections");

        loop {
            if self.tracker.is_closed() {
                break;
            }
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let srv = Arc::clone(&self);
                            let guard = self.tracker.track(&stream);
                            tokio::spawn(async move {
                                let mut guard = guard;
                                let service_srv = Arc::clone(&srv);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let srv = Arc::clone(&service_srv);
                                    async move { Ok::<_, hyper::Error>(srv.handle(req).await) }
                                });
                                let io = TokioIo::new(stream);
                                let builder = AutoBuilder::new(TokioExecutor::new());
                                let conn = builder.serve_connection(io, service);
                                tokio::select! {
                                    result = conn => {
                                        if let Err(e) = result {
                                            debug!(peer = %peer, error = %e, "connection error");
                                        }
                                    }
                                    // Dropping the serve future closes the stream.
                                    _ = guard.closed() => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Release the port before the done signal becomes observable, so a
        // caller returning from close() can re-bind immediately.
        drop(listener);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.done_tx.send(true);
        Ok(())
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let file_req = FileRequest {
            method: req.method().clone(),
            path: path.clone(),
            headers: req.headers().clone(),
        };
        let resp = self.mounts.serve(file_req).await;
        let hook = self.serve_hook.lock().clone();
        if let Some(hook) = hook {
            hook(&path, resp.status());
        }
        resp
    }

    /// Tear down every accepted connection, stop the accept loop and wait
    /// for it to finish. Closing a server that never started is a no-op.
    pub async fn close(&self) -> anyhow::Result<()> {
        let started = *self.started_tx.borrow();
        tokio::time::timeout(CLOSE_TIMEOUT, async {
            self.tracker.close().await;
            if started {
                let mut done_rx = self.done_tx.subscribe();
                while !*done_rx.borrow_and_update() {
                    if done_rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow!("server on port {} did not shut down in time", self.port()))
    }
}

/// Ordered collection of managed servers with unique ports.
pub struct ServerPool {
    srvs: Mutex<Vec<Arc<ManagedServer>>>,
    registry: Arc<Registry>,
    start_tx: mpsc::Sender<Arc<ManagedServer>>,
    start_rx: Mutex<Option<mpsc::Receiver<Arc<ManagedServer>>>>,
}

impl ServerPool {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (start_tx, start_rx) = mpsc::channel(1);
        Self {
            srvs: Mutex::new(Vec::new()),
            registry,
            start_tx,
            start_rx: Mutex::new(Some(start_rx)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create a managed server for `addr` and register it, without starting
    /// it. The address is validated by a test bind so a bad address is
    /// reported here rather than from the background runner.
    pub async fn add(&self, addr: &str) -> std::io::Result<Arc<ManagedServer>> {
        check_addr(addr).await?;
        let srv = ManagedServer::new(addr, Arc::clone(&self.registry));
        self.srvs.lock().push(Arc::clone(&srv));
        Ok(srv)
    }

    pub fn get(&self, port: u16) -> Option<Arc<ManagedServer>> {
        self.srvs
            .lock()
            .iter()
            .find(|srv| srv.port() == port)
            .cloned()
    }

    /// Snapshot of the pool in insertion order.
    pub fn servers(&self) -> Vec<Arc<ManagedServer>> {
        self.srvs.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.srvs.lock().len()
    }

    /// Dispatch a registered, not-yet-running server to the runner loop.
    /// Returns `false` if the server is unknown or already running.
    pub async fn start_srv(&self, srv: &Arc<ManagedServer>) -> bool {
        if srv.running() {
            return false;
        }
        let registered = self
            .srvs
            .lock()
            .iter()
            .any(|member| Arc::ptr_eq(member, srv));
        if !registered {
            return false;
        }
        self.start_tx.send(Arc::clone(srv)).await.is_ok()
    }

    /// Close the server bound to `port` and drop it from the pool. Returns
    /// `Ok(false)` if no such server exists; the port is free for re-binding
    /// once this returns `Ok(true)`.
    pub async fn remove(&self, port: u16) -> anyhow::Result<bool> {
        let srv = {
            let srvs = self.srvs.lock();
            match srvs.iter().find(|srv| srv.port() == port) {
                Some(srv) => Arc::clone(srv),
                None => return Ok(false),
            }
        };
        srv.close().await?;
        self.srvs.lock().retain(|member| !Arc::ptr_eq(member, &srv));
        Ok(true)
    }

    /// Consume the start channel, running each dispatched server until its
    /// listener closes. A close initiated by [`remove`](Self::remove) is the
    /// expected termination path, not an error.
    pub async fn listen(&self) {
        let mut start_rx = match self.start_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("server pool listen() called twice");
                return;
            }
        };
        while let Some(srv) = start_rx.recv().await {
            tokio::spawn(async move {
                let runner = Arc::clone(&srv);
                if let Err(e) = runner.listen_and_serve().await {
                    error!(addr = %srv.addr(), error = %e, "server terminated");
                } else {
                    info!(addr = %srv.addr(), "server closed");
                }
            });
        }
    }
}

/// Validate an address by binding and immediately releasing it.
async fn check_addr(addr: &str) -> std::io::Result<()> {
    TcpListener::bind(addr).await.map(drop)
}
