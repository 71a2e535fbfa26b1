//! Server lifecycle
//!
//! A [`ServerHandle`] owns the bound listener, a multi-threaded tokio runtime
//! and the composed [`Dispatcher`]. It moves through
//! `Composed -> Started -> Stopping -> Stopped`; `Stopped` is terminal.
//!
//! Connections are served by hyper (HTTP/1.1 with upgrades) on one task each.
//! On [`ServerHandle::stop`] the accept loop ends, open connections are asked
//! to finish gracefully and the handle waits up to the shutdown timeout for
//! them to drain.

use crate::dispatch::Dispatcher;
use crate::{Error, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use std::convert::Infallible;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle state of a [`ServerHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Socket bound, not accepting yet
    Composed,
    /// Accepting connections
    Started,
    /// No longer accepting; open connections are draining
    Stopping,
    /// Socket released; cannot be restarted
    Stopped,
}

// ============================================================================
// Connection Tracking for Graceful Shutdown
// ============================================================================

/// Counts open connections so `stop` can wait for them to drain
#[derive(Debug, Default)]
pub(crate) struct ConnectionTracker {
    active: AtomicU64,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Count a connection until the returned guard is dropped
    pub(crate) fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(self.clone())
    }

    #[inline]
    pub(crate) fn count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }
}

pub(crate) struct ConnectionGuard(Arc<ConnectionTracker>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves once the server starts shutting down
///
/// A dropped sender counts as shutdown.
pub(crate) async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Resolve `host:port` to the first socket address
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{}:{} ({})", host, port, e)))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(format!("{}:{}", host, port)))
}

/// Bind a listening socket
///
/// The socket is listening as soon as this returns; connections queue in
/// the backlog until the accept loop starts.
pub(crate) fn bind(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let bind_failure = |source| Error::BindFailure { addr, source };

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_failure)?;

    // SO_REUSEADDR - allow binding to address in TIME_WAIT
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(bind_failure)?;

    // TCP_NODELAY - inherited by accepted sockets on most platforms
    socket.set_nodelay(true).map_err(bind_failure)?;

    socket.bind(&addr.into()).map_err(bind_failure)?;
    socket.listen(1024).map_err(bind_failure)?;
    socket.set_nonblocking(true).map_err(bind_failure)?;

    Ok(socket.into())
}

/// Guarded by a mutex that is never held while waiting on connections
struct Lifecycle {
    state: ServerState,
    /// Present until started or stopped
    listener: Option<std::net::TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

/// A composed server
///
/// Created by [`ServerBuilder::build`](crate::ServerBuilder::build). Dropping
/// the handle stops the server.
pub struct ServerHandle {
    /// Taken on drop
    runtime: Option<tokio::runtime::Runtime>,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tracker: Arc<ConnectionTracker>,
    shutdown_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    stopped: Condvar,
}

impl ServerHandle {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        listener: std::net::TcpListener,
        workers: usize,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("quay-worker")
            .enable_all()
            .build()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            runtime: Some(runtime),
            dispatcher: Arc::new(dispatcher),
            local_addr,
            shutdown_tx,
            tracker: Arc::new(ConnectionTracker::new()),
            shutdown_timeout,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Composed,
                listener: Some(listener),
                accept_task: None,
            }),
            stopped: Condvar::new(),
        })
    }

    /// Start accepting connections and return immediately
    ///
    /// A no-op when already started. A stopped server cannot be restarted.
    pub fn start_in_background(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ServerState::Started => return Ok(()),
            ServerState::Stopping | ServerState::Stopped => return Err(Error::AlreadyStopped),
            ServerState::Composed => {}
        }

        let runtime = self.runtime.as_ref().ok_or(Error::AlreadyStopped)?;
        let std_listener = lifecycle.listener.take().ok_or(Error::AlreadyStopped)?;
        let listener = {
            let _enter = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let task = runtime.spawn(accept_loop(
            listener,
            self.dispatcher.clone(),
            self.tracker.clone(),
            self.shutdown_tx.subscribe(),
        ));
        lifecycle.accept_task = Some(task);
        lifecycle.state = ServerState::Started;

        tracing::info!(addr = %self.local_addr, "Server started");
        Ok(())
    }

    /// Start and block until the server is stopped
    pub fn start(&self) -> Result<()> {
        self.start_in_background()?;
        self.join();
        Ok(())
    }

    /// Block until the server is stopped
    pub fn join(&self) {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.state != ServerState::Stopped {
            self.stopped.wait(&mut lifecycle);
        }
    }

    /// Stop the server and release its socket
    ///
    /// Waits up to the shutdown timeout for open connections to finish.
    /// Stopping twice is a no-op; a call made while another is draining
    /// waits for that drain to complete.
    pub fn stop(&self) {
        let accept_task = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                ServerState::Stopped => return,
                ServerState::Stopping => {
                    drop(lifecycle);
                    self.join();
                    return;
                }
                ServerState::Composed => {
                    lifecycle.listener = None;
                    lifecycle.state = ServerState::Stopped;
                    self.stopped.notify_all();
                    tracing::info!(addr = %self.local_addr, "Server stopped before start");
                    return;
                }
                ServerState::Started => {}
            }
            lifecycle.state = ServerState::Stopping;
            lifecycle.accept_task.take()
        };

        tracing::info!(addr = %self.local_addr, "Stopping server");
        self.shutdown_tx.send_replace(true);

        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            let accepting = accept_task.as_ref().is_some_and(|t| !t.is_finished());
            let active = self.tracker.count();
            if !accepting && active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(active, "Shutdown timeout reached with connections still open");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Some(task) = accept_task {
            task.abort();
        }

        self.lifecycle.lock().state = ServerState::Stopped;
        self.stopped.notify_all();
        tracing::info!(addr = %self.local_addr, "Server stopped");
    }

    /// True only while accepting connections
    pub fn is_started(&self) -> bool {
        self.state() == ServerState::Started
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open HTTP connections
    pub fn active_connections(&self) -> u64 {
        self.tracker.count()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .field("active_connections", &self.tracker.count())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<ConnectionTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let guard = tracker.track();
                tokio::spawn(serve_connection(
                    stream,
                    remote,
                    dispatcher.clone(),
                    shutdown.clone(),
                    guard,
                ));
            }
            _ = shutdown_signal(&mut shutdown) => break,
        }
    }
    tracing::debug!("Accept loop finished");
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
    _guard: ConnectionGuard,
) {
    let session_shutdown = shutdown.clone();
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        let shutdown = session_shutdown.clone();
        async move { Ok::<_, Infallible>(dispatcher.handle(req, remote, shutdown).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                tracing::debug!(%remote, error = %e, "Connection error");
            }
            return;
        }
        _ = shutdown_signal(&mut shutdown) => {}
    }

    conn.as_mut().graceful_shutdown();
    if let Err(e) = conn.await {
        tracing::debug!(%remote, error = %e, "Connection error during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracker() {
        let tracker = Arc::new(ConnectionTracker::new());
        assert_eq!(tracker.count(), 0);

        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.count(), 2);

        drop(a);
        assert_eq!(tracker.count(), 1);
        drop(b);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_resolve() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());

        assert!(matches!(
            resolve("not a host name", 80),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_bind_conflict() {
        let first = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        match bind(addr) {
            Err(Error::BindFailure { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind failure, got {:?}", other.map(|l| l.local_addr())),
        }

        drop(first);
        assert!(bind(addr).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_signal(&mut rx).await });

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_signal(&mut rx).await;
    }
}
