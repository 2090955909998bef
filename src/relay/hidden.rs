//! Accept loop on the hidden-service socket.
//!
//! # Responsibilities
//! - Accept overlay connections, at most `max_sessions` at a time
//! - Open one [`RelaySession`] per connection towards the gateway
//! - Log session errors from a single channel
//! - On stop: close the socket, let sessions drain, then force-close them
//!
//! # Design Decisions
//! - An accept error is fatal to the relay, never to the gateway
//! - Sessions share nothing but the error channel

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use super::session::{RelaySession, RelaySessionError, SessionId, SessionSettings};
use crate::config::RelayConfig;
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::observability::metrics;

/// Relay from the hidden-service socket to the local gateway.
#[derive(Debug, Clone)]
pub struct HiddenRelay {
    target: SocketAddr,
    settings: SessionSettings,
    max_sessions: usize,
    drain_grace: Duration,
}

impl HiddenRelay {
    /// `gateway_addr` is where the gateway listens; a wildcard bind address
    /// is reached through loopback.
    pub fn new(config: &RelayConfig, gateway_addr: SocketAddr) -> Self {
        let target = match gateway_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(Ipv4Addr::LOCALHOST.into(), gateway_addr.port())
            }
            IpAddr::V6(ip) if ip.is_unspecified() => {
                SocketAddr::new(Ipv6Addr::LOCALHOST.into(), gateway_addr.port())
            }
            _ => gateway_addr,
        };
        Self {
            target,
            settings: SessionSettings::from(config),
            max_sessions: config.max_sessions.max(1),
            drain_grace: config.drain_grace(),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Start accepting on `listener`.
    pub fn start(self, listener: TcpListener) -> io::Result<RelayHandle> {
        let local_addr = listener.local_addr()?;
        let stop = Shutdown::new();
        tracing::info!(
            address = %local_addr,
            target = %self.target,
            max_sessions = self.max_sessions,
            "Hidden relay accepting"
        );
        let task = tokio::spawn(accept_loop(listener, self, stop.subscribe()));
        Ok(RelayHandle {
            local_addr,
            stop,
            task,
        })
    }
}

/// Running relay.
#[derive(Debug)]
pub struct RelayHandle {
    local_addr: SocketAddr,
    stop: Shutdown,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once the accept loop has ended and every session is closed.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting and wait for sessions to drain or be force-closed.
    pub async fn stop(self) {
        self.stop.trigger();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Relay accept loop panicked");
        }
        tracing::info!(address = %self.local_addr, "Hidden relay stopped");
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "session limit closed"))?;
    let (stream, peer) = listener.accept().await?;
    Ok((stream, peer, permit))
}

async fn accept_loop(listener: TcpListener, relay: HiddenRelay, mut stop: ShutdownSignal) {
    let limit = Arc::new(Semaphore::new(relay.max_sessions));
    let force_close = Shutdown::new();
    let (errors, error_rx) = mpsc::unbounded_channel();
    let error_log = tokio::spawn(log_errors(error_rx));
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = accept_with_permit(&listener, &limit) => match accepted {
                Ok((stream, peer, permit)) => {
                    sessions.spawn(serve_session(
                        stream,
                        peer,
                        relay.target,
                        relay.settings,
                        errors.clone(),
                        force_close.subscribe(),
                        permit,
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Relay accept failed, no longer accepting");
                    break;
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Relay session panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    if !sessions.is_empty() {
        tracing::info!(
            sessions = sessions.len(),
            grace_ms = relay.drain_grace.as_millis() as u64,
            "Draining relay sessions"
        );
        let drained = tokio::time::timeout(relay.drain_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = sessions.len(), "Relay grace period elapsed, closing sessions");
            force_close.trigger();
            while sessions.join_next().await.is_some() {}
        }
    }

    drop(errors);
    let _ = error_log.await;
}

async fn serve_session(
    client: TcpStream,
    peer: SocketAddr,
    target: SocketAddr,
    settings: SessionSettings,
    errors: mpsc::UnboundedSender<RelaySessionError>,
    force_close: ShutdownSignal,
    _permit: OwnedSemaphorePermit,
) {
    let id = SessionId::new();
    match RelaySession::open(id, client, peer, target).await {
        Ok(session) => {
            tracing::debug!(session_id = %id, peer_addr = %peer, "Relay session opened");
            metrics::relay_session_opened();
            session.run(settings, &errors, force_close).await;
            metrics::relay_session_closed();
        }
        Err(e) => {
            let _ = errors.send(e);
        }
    }
}

async fn log_errors(mut errors: mpsc::UnboundedReceiver<RelaySessionError>) {
    while let Some(e) = errors.recv().await {
        metrics::record_relay_error();
        match e {
            RelaySessionError::Connect { .. } => tracing::warn!(error = %e, "Relay session aborted"),
            RelaySessionError::Pump { .. } => tracing::debug!(error = %e, "Relay stream error"),
        }
    }
}
