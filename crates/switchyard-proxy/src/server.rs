//! Accept loops for the plaintext and TLS listeners.
//!
//! One task per connection, HTTP/1.1 via hyper. Each listener stops
//! accepting (and closes its socket) as soon as the lifecycle leaves
//! `Running`. Open connections finish their current request and close
//! on `Draining`, and are dropped outright on `Stopped`.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use switchyard_core::{DrainState, Lifecycle};

use crate::proxy::{ClientInfo, Proxy};

struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts open client connections across all listeners.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Count a connection until the returned guard drops.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Resolve once no connections are open.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    proxy: Arc<Proxy>,
    tls: Option<TlsAcceptor>,
    lifecycle: Lifecycle,
    connections: ConnectionTracker,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        proxy: Arc<Proxy>,
        lifecycle: Lifecycle,
        connections: ConnectionTracker,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            proxy,
            tls: None,
            lifecycle,
            connections,
        })
    }

    /// Terminate TLS on every accepted connection.
    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(config));
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the router starts draining, then close the socket.
    pub async fn serve(self) {
        let addr = self.listener.local_addr().ok();
        let mut state = self.lifecycle.subscribe();

        info!(?addr, tls = self.tls.is_some(), "proxy listening");

        loop {
            if *state.borrow_and_update() != DrainState::Running {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        info!(?addr, "proxy listener closed");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let guard = self.connections.track();
        let proxy = Arc::clone(&self.proxy);
        let tls = self.tls.clone();
        let state = self.lifecycle.subscribe();
        let _ = stream.set_nodelay(true);

        tokio::spawn(async move {
            let _guard = guard;
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, peer, true, proxy, state).await,
                    Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, peer, false, proxy, state).await,
            }
        });
    }
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    tls: bool,
    proxy: Arc<Proxy>,
    mut state: watch::Receiver<DrainState>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client = ClientInfo { addr: peer, tls };
    let svc = service_fn(move |req: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, Infallible>(proxy.handle(req, client).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let mut closing = false;
    if *state.borrow_and_update() != DrainState::Running {
        conn.as_mut().graceful_shutdown();
        closing = true;
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "connection error");
                }
                return;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    if let Err(e) = conn.as_mut().await {
                        debug!(%peer, error = %e, "connection error");
                    }
                    return;
                }
                match *state.borrow_and_update() {
                    DrainState::Running => {}
                    DrainState::Draining if !closing => {
                        conn.as_mut().graceful_shutdown();
                        closing = true;
                    }
                    DrainState::Draining => {}
                    DrainState::Stopped => {
                        debug!(%peer, "force closing connection");
                        return;
                    }
                }
            }
        }
    }
}
