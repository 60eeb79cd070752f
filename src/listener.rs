//! Connection tracking for managed servers.
//!
//! Every connection accepted by a managed server registers with its
//! [`ConnTracker`]. Closing the tracker broadcasts a shutdown signal that
//! makes each connection task drop its serve future (closing the TCP
//! stream), then waits until all registered connections are gone, so the
//! close is only observable once every accepted connection is down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::warn;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

pub struct ConnTracker {
    shutdown_tx: watch::Sender<bool>,
    active: AtomicUsize,
    drained: Notify,
}

impl ConnTracker {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            shutdown_tx,
            active: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Register a newly accepted connection and enable TCP keep-alive on it.
    /// The returned guard must live as long as the connection's task.
    pub fn track(self: &Arc<Self>, stream: &TcpStream) -> ConnGuard {
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to enable TCP keep-alive");
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnGuard {
            tracker: Arc::clone(self),
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// A receiver that resolves to `true` when the tracker closes; the
    /// accept loop selects on this.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every tracked connection to close, then wait until all of
    /// them have deregistered.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        while self.active.load(Ordering::SeqCst) > 0 {
            self.drained.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Registration guard for one accepted connection.
pub struct ConnGuard {
    tracker: Arc<ConnTracker>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnGuard {
    /// Resolves when the tracker is closed. Selecting on this against the
    /// connection's serve future is what tears the connection down.
    pub async fn closed(&mut self) {
        while !*self.shutdown_rx.borrow_and_update() {
            if self.shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        self.tracker.drained.notify_one();
    }
}
