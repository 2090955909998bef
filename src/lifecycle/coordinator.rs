//! Startup and shutdown sequencing.
//!
//! # Responsibilities
//! - Build the filter chain and router from configuration
//! - Start the gateway listener
//! - When the relay is enabled: bootstrap the overlay, publish the hidden
//!   service and start the relay on it
//! - Shut everything down in reverse order, exactly once
//!
//! # Design Decisions
//! - The inner lock is never held across the overlay bootstrap, so
//!   `shutdown()` can interrupt a bootstrap that is still running
//! - Overlay and relay failures are logged and leave the gateway serving;
//!   a bootstrapped overlay is torn down again and the phase falls back to
//!   `GatewayRunning`
//! - Only a gateway failure is returned from `start()`

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::handler::ApiHandler;
use crate::http::{wrap_app, FilterChain, GatewayError, GatewayServer};
use crate::lifecycle::shutdown::Shutdown;
use crate::overlay::{HiddenListener, HiddenServiceSpec, OverlayBootstrapError, OverlayNetwork, OverlaySlot};
use crate::relay::{HiddenRelay, RelayHandle};
use crate::routing::build_router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ChainBuilt,
    GatewayRunning,
    OverlayBootstrapped,
    RelayRunning,
    Stopped,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("already started (phase {0:?})")]
    AlreadyStarted(Phase),
}

struct Inner {
    phase: Phase,
    gateway: Option<GatewayServer>,
    gateway_addr: Option<SocketAddr>,
    relay: Option<RelayHandle>,
    hidden_address: Option<String>,
}

/// Owns the gateway, the overlay slot and the relay.
pub struct LifecycleCoordinator {
    config: Arc<GatewayConfig>,
    handler: Arc<dyn ApiHandler>,
    overlay: OverlaySlot,
    cancel: Shutdown,
    inner: Mutex<Inner>,
}

impl LifecycleCoordinator {
    pub fn new(
        config: GatewayConfig,
        handler: Arc<dyn ApiHandler>,
        network: Arc<dyn OverlayNetwork>,
    ) -> Self {
        let overlay = OverlaySlot::new(network, config.relay.data_dir.clone());
        Self {
            config: Arc::new(config),
            handler,
            overlay,
            cancel: Shutdown::new(),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                gateway: None,
                gateway_addr: None,
                relay: None,
                hidden_address: None,
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    pub async fn gateway_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.gateway_addr
    }

    /// Local address of the hidden-service socket, while the relay runs.
    pub async fn relay_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.relay.as_ref().map(RelayHandle::local_addr)
    }

    /// Overlay address of the published service, when known.
    pub async fn hidden_address(&self) -> Option<String> {
        self.inner.lock().await.hidden_address.clone()
    }

    /// Bring the system up.
    ///
    /// Returns once the gateway accepts and, if enabled, the relay runs or
    /// has failed. May take as long as the overlay bootstrap.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let gateway_addr = {
            let mut inner = self.inner.lock().await;
            if inner.phase != Phase::Idle {
                return Err(LifecycleError::AlreadyStarted(inner.phase));
            }

            let chain = FilterChain::from_config(&self.config).await;
            let router = build_router(&self.config.api, Arc::clone(&self.handler)).await;
            let app = wrap_app(&chain, router);
            inner.phase = Phase::ChainBuilt;

            let mut gateway = GatewayServer::new(self.config.listener.clone(), app);
            let addr = match gateway.start().await {
                Ok(addr) => addr,
                Err(e) => {
                    inner.phase = Phase::Stopped;
                    return Err(e.into());
                }
            };
            inner.gateway = Some(gateway);
            inner.gateway_addr = Some(addr);
            inner.phase = Phase::GatewayRunning;
            addr
        };

        if !self.config.relay.enabled {
            tracing::info!("Hidden relay disabled");
            return Ok(());
        }

        let mut cancel = self.cancel.subscribe();
        let hidden = tokio::select! {
            _ = cancel.recv() => {
                tracing::info!("Shutdown requested during overlay bootstrap");
                return Ok(());
            }
            hidden = self.open_hidden(gateway_addr.port()) => hidden,
        };
        let hidden = match hidden {
            Ok(hidden) => hidden,
            Err(e) => {
                tracing::error!(error = %e, "Overlay unavailable, hidden relay disabled");
                self.abandon_relay(&mut *self.inner.lock().await).await;
                return Ok(());
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Stopped {
            return Ok(());
        }
        match HiddenRelay::new(&self.config.relay, gateway_addr).start(hidden.listener) {
            Ok(relay) => {
                if let Some(address) = &hidden.address {
                    tracing::info!(address = %address, "Hidden service reachable");
                }
                inner.relay = Some(relay);
                inner.hidden_address = hidden.address;
                inner.phase = Phase::RelayRunning;
            }
            Err(e) => {
                tracing::error!(error = %e, "Hidden relay failed to start");
                self.abandon_relay(&mut inner).await;
            }
        }
        Ok(())
    }

    /// Release an overlay the relay will not use and fall back to gateway-only.
    async fn abandon_relay(&self, inner: &mut Inner) {
        self.overlay.teardown().await;
        if inner.phase != Phase::Stopped {
            inner.phase = Phase::GatewayRunning;
        }
    }

    async fn open_hidden(&self, gateway_port: u16) -> Result<HiddenListener, OverlayBootstrapError> {
        let instance = self.overlay.get_or_bootstrap().await?;
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == Phase::Stopped {
                return Err(OverlayBootstrapError::ShutDown);
            }
            inner.phase = Phase::OverlayBootstrapped;
        }

        let relay = &self.config.relay;
        let spec = HiddenServiceSpec {
            service_id: relay.service_id.clone(),
            hidden_port: relay.hidden_port.unwrap_or(gateway_port),
            local_port: relay.listen_port,
        };
        instance.open_hidden_listener(&spec).await
    }

    /// Stop the relay, the overlay and the gateway, in that order.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.trigger();
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Stopped {
            return;
        }

        if let Some(relay) = inner.relay.take() {
            relay.stop().await;
        }
        self.overlay.teardown().await;
        if let Some(mut gateway) = inner.gateway.take() {
            gateway.stop().await;
        }
        inner.hidden_address = None;
        inner.phase = Phase::Stopped;
        tracing::info!("Shutdown complete");
    }
}
