//! TCP listener construction with backpressure.
//!
//! # Responsibilities
//! - Resolve and bind the configured host:port
//! - Honor address reuse so a restart after a crash can rebind
//! - Load the TLS context before any socket is opened
//! - Enforce max_connections via semaphore

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;

use crate::config::ListenerConfig;
use crate::net::tls::{load_tls_acceptor, TlsError};

const BACKLOG: u32 = 1024;

/// The listener could not be started. Fatal to gateway startup.
#[derive(Debug, Error)]
pub enum ListenerStartError {
    #[error("cannot resolve {addr}: {source}")]
    Resolve {
        addr: String,
        source: std::io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS context failed: {0}")]
    Tls(#[from] TlsError),
}

/// Builds a bound, not-yet-accepting [`Listener`] from configuration.
#[derive(Debug)]
pub struct ListenerBuilder<'a> {
    config: &'a ListenerConfig,
}

impl<'a> ListenerBuilder<'a> {
    pub fn new(config: &'a ListenerConfig) -> Self {
        Self { config }
    }

    /// Build the listener.
    ///
    /// A port of 0 binds an ephemeral port.
    pub async fn build(self) -> Result<Listener, ListenerStartError> {
        let config = self.config;

        // TLS first: a bad keystore must fail before a socket exists.
        let tls = if config.tls_enabled {
            Some(load_tls_acceptor(config).await?)
        } else {
            None
        };

        let addr_str = format!("{}:{}", bracket_host(&config.host), config.port);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|source| ListenerStartError::Resolve {
                addr: addr_str.clone(),
                source,
            })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match bind(addr, config.reuse_address) {
                Ok(inner) => {
                    let local_addr = inner.local_addr().unwrap_or(addr);
                    tracing::info!(
                        address = %local_addr,
                        tls = tls.is_some(),
                        max_connections = config.max_connections,
                        "Listener bound"
                    );
                    return Ok(Listener {
                        inner,
                        tls,
                        connection_limit: Arc::new(Semaphore::new(config.max_connections)),
                        max_connections: config.max_connections,
                        idle_timeout: config.idle_timeout(),
                    });
                }
                Err(e) => {
                    tracing::debug!(address = %addr, error = %e, "Bind attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(ListenerStartError::Bind {
            addr: addr_str,
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
            }),
        })
    }
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn bind(addr: SocketAddr, reuse_address: bool) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(reuse_address)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    idle_timeout: Option<Duration>,
}

impl Listener {
    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| std::io::Error::other("listener connection limit closed"))?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// TLS acceptor, when TLS is terminated here.
    pub fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> ListenerConfig {
        ListenerConfig {
            port: 0,
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let config = ephemeral();
        let listener = ListenerBuilder::new(&config).build().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert!(listener.tls().is_none());
        assert_eq!(listener.available_permits(), config.max_connections);
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let first = ListenerBuilder::new(&ephemeral()).build().await.unwrap();
        let config = ListenerConfig {
            port: first.local_addr().unwrap().port(),
            reuse_address: false,
            ..ListenerConfig::default()
        };
        assert!(matches!(
            ListenerBuilder::new(&config).build().await,
            Err(ListenerStartError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_resolve_error() {
        let config = ListenerConfig {
            host: "no-such-host.invalid".to_string(),
            ..ephemeral()
        };
        assert!(matches!(
            ListenerBuilder::new(&config).build().await,
            Err(ListenerStartError::Resolve { .. })
        ));
    }

    #[tokio::test]
    async fn bad_keystore_fails_before_bind() {
        let config = ListenerConfig {
            tls_enabled: true,
            tls_keystore_path: "/nonexistent/keystore.pem".to_string(),
            ..ephemeral()
        };
        assert!(matches!(
            ListenerBuilder::new(&config).build().await,
            Err(ListenerStartError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let config = ListenerConfig {
            max_connections: 1,
            ..ephemeral()
        };
        let listener = ListenerBuilder::new(&config).build().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 0);
        drop(permit);
        assert_eq!(listener.available_permits(), 1);
    }
}
