//! One relayed connection: a client socket paired with a fresh gateway socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::pump::{self, Activity, Direction};
use crate::config::RelayConfig;
use crate::lifecycle::shutdown::ShutdownSignal;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Failure contained to a single session.
#[derive(Debug, Error)]
pub enum RelaySessionError {
    #[error("{session}: cannot reach gateway at {target}: {source}")]
    Connect {
        session: SessionId,
        target: SocketAddr,
        source: io::Error,
    },

    #[error("{session}: {direction} pump failed: {source}")]
    Pump {
        session: SessionId,
        direction: Direction,
        source: io::Error,
    },
}

/// Per-session limits, copied out of [`RelayConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub upload_buffer: usize,
    pub download_buffer: usize,
    pub idle_timeout: Option<Duration>,
}

impl From<&RelayConfig> for SessionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            upload_buffer: config.upload_buffer_bytes,
            download_buffer: config.download_buffer_bytes,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The gateway side finished (end-of-stream or error).
    Completed,
    /// No bytes moved for the configured idle timeout.
    IdleTimeout,
    /// Closed by relay shutdown after the drain grace period.
    ForceClosed,
}

#[derive(Debug)]
pub struct RelaySession {
    id: SessionId,
    peer: SocketAddr,
    client: TcpStream,
    server: TcpStream,
    created_at: Instant,
}

impl RelaySession {
    /// Connect a freshly accepted client to the gateway at `target`.
    pub async fn open(
        id: SessionId,
        client: TcpStream,
        peer: SocketAddr,
        target: SocketAddr,
    ) -> Result<Self, RelaySessionError> {
        let server = TcpStream::connect(target)
            .await
            .map_err(|source| RelaySessionError::Connect {
                session: id,
                target,
                source,
            })?;
        let _ = client.set_nodelay(true);
        let _ = server.set_nodelay(true);
        Ok(Self {
            id,
            peer,
            client,
            server,
            created_at: Instant::now(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Pump both directions until the download side finishes, the session
    /// idles out or `force_close` fires.
    ///
    /// Pump errors go to `errors` and never past this session.
    pub async fn run(
        self,
        settings: SessionSettings,
        errors: &mpsc::UnboundedSender<RelaySessionError>,
        mut force_close: ShutdownSignal,
    ) -> SessionEnd {
        let id = self.id;
        let (client_read, client_write) = self.client.into_split();
        let (server_read, server_write) = self.server.into_split();
        let activity = Arc::new(Activity::new());

        let upload = tokio::spawn({
            let activity = Arc::clone(&activity);
            let errors = errors.clone();
            async move {
                if let Err(source) =
                    pump::upload(client_read, server_write, settings.upload_buffer, &activity).await
                {
                    let _ = errors.send(RelaySessionError::Pump {
                        session: id,
                        direction: Direction::Upload,
                        source,
                    });
                }
            }
        });

        let download = pump::download(server_read, client_write, settings.download_buffer, &activity);
        let end = tokio::select! {
            result = download => {
                if let Err(source) = result {
                    let _ = errors.send(RelaySessionError::Pump {
                        session: id,
                        direction: Direction::Download,
                        source,
                    });
                }
                SessionEnd::Completed
            }
            _ = idle_watchdog(&activity, settings.idle_timeout) => SessionEnd::IdleTimeout,
            _ = force_close.recv() => SessionEnd::ForceClosed,
        };

        // Dropping the upload half closes whatever is left of both sockets.
        upload.abort();
        tracing::debug!(
            session_id = %id,
            peer_addr = %self.peer,
            end = ?end,
            duration_ms = self.created_at.elapsed().as_millis() as u64,
            "Relay session closed"
        );
        end
    }
}

async fn idle_watchdog(activity: &Activity, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        let quiet = activity.idle_for();
        if quiet >= timeout {
            return;
        }
        tokio::time::sleep(timeout - quiet).await;
    }
}
