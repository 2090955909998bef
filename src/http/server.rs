//! Gateway HTTP server.
//!
//! # Responsibilities
//! - Own the listener and the fully wired application router
//! - Run the accept loop, one task per connection
//! - Terminate TLS and enforce the idle timeout per connection
//! - Serve HTTP/1.1 and HTTP/2 through hyper
//! - Drain connections on stop, force-closing after the grace period
//!
//! # Design Decisions
//! - `start()` binds before returning, so the caller knows the address is live
//! - Stopping drops the listener first: no new connections while draining
//! - Stopped is terminal; a stopped server is never restarted

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    Router,
};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

use crate::config::ListenerConfig;
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::net::{
    ConnectionGuard, ConnectionId, ConnectionPermit, ConnectionTracker, IdleTimeoutStream,
    InFlight, Listener, ListenerBuilder, ListenerStartError,
};

/// Lifecycle state of a [`GatewayServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Listener(#[from] ListenerStartError),

    #[error("gateway cannot start while {0:?}")]
    InvalidState(ServerState),
}

struct Running {
    stop: Shutdown,
    task: JoinHandle<()>,
}

/// HTTP(S) gateway bound to the configured listener.
pub struct GatewayServer {
    config: ListenerConfig,
    app: Router,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    running: Option<Running>,
}

impl GatewayServer {
    /// Create a server. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ListenerConfig, app: Router) -> Self {
        Self {
            config,
            app,
            state: ServerState::Unstarted,
            local_addr: None,
            running: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start accepting.
    ///
    /// A listener failure moves the server to `Stopped`.
    pub async fn start(&mut self) -> Result<SocketAddr, GatewayError> {
        if self.state != ServerState::Unstarted {
            return Err(GatewayError::InvalidState(self.state));
        }

        let bound = match ListenerBuilder::new(&self.config).build().await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)).map_err(|source| {
                ListenerStartError::Bind {
                    addr: format!("{}:{}", self.config.host, self.config.port),
                    source,
                }
            }),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(error = %e, "Gateway listener failed to start");
                self.state = ServerState::Stopped;
                return Err(e.into());
            }
        };

        let stop = Shutdown::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.app.clone(),
            stop.subscribe(),
            self.config.shutdown_grace(),
        ));

        tracing::info!(address = %addr, tls = self.config.tls_enabled, "Gateway started");
        self.local_addr = Some(addr);
        self.running = Some(Running { stop, task });
        self.state = ServerState::Running;
        Ok(addr)
    }

    /// Stop accepting, drain in-flight connections and release the socket.
    ///
    /// Idempotent.
    pub async fn stop(&mut self) {
        if let Some(Running { stop, task }) = self.running.take() {
            stop.trigger();
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Gateway accept loop panicked");
            }
            tracing::info!("Gateway stopped");
        }
        self.state = ServerState::Stopped;
    }
}

async fn accept_loop(listener: Listener, app: Router, mut stop: ShutdownSignal, grace: Duration) {
    let tls = listener.tls().cloned();
    let idle = listener.idle_timeout();
    let drain = Shutdown::new();
    let tracker = ConnectionTracker::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let connection = Connection {
                        peer,
                        _permit: permit,
                        guard: tracker.track(),
                        tls: tls.clone(),
                        idle,
                    };
                    connections.spawn(connection.serve(stream, app.clone(), drain.subscribe()));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    let in_flight = tracker.active_count();
    drain.trigger();
    tracing::info!(connections = in_flight, grace_ms = grace.as_millis() as u64, "Draining connections");

    if tokio::time::timeout(grace, tracker.wait_for_drain()).await.is_err() {
        tracing::warn!(
            remaining = tracker.active_count(),
            "Grace period elapsed, closing remaining connections"
        );
    }
    connections.shutdown().await;
}

struct Connection {
    peer: SocketAddr,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
    tls: Option<TlsAcceptor>,
    idle: Option<Duration>,
}

impl Connection {
    async fn serve(self, stream: TcpStream, app: Router, drain: ShutdownSignal) {
        let id = self.guard.id();
        let in_flight = InFlight::new();
        let stream = IdleTimeoutStream::new(stream, self.idle).with_in_flight(in_flight.clone());
        match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => serve_http(stream, self.peer, id, app, in_flight, drain).await,
                Err(e) => {
                    tracing::debug!(connection_id = %id, peer_addr = %self.peer, error = %e, "TLS handshake failed");
                }
            },
            None => serve_http(stream, self.peer, id, app, in_flight, drain).await,
        }
    }
}

async fn serve_http<I>(
    io: I,
    peer: SocketAddr,
    id: ConnectionId,
    app: Router,
    in_flight: InFlight,
    mut drain: ShutdownSignal,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        // Busy until the response body has been written out and dropped.
        let guard = in_flight.enter();
        let response = app.clone().oneshot(request);
        async move {
            let response = response.await?;
            Ok::<_, Infallible>(response.map(|body| {
                Body::new(body.map_frame(move |frame| {
                    let _busy = &guard;
                    frame
                }))
            }))
        }
    });

    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = drain.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };
    if let Err(e) = result {
        tracing::debug!(connection_id = %id, peer_addr = %peer, error = %e, "Connection ended with error");
    }
}
