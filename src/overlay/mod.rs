//! Anonymity overlay integration.
//!
//! # Data Flow
//! ```text
//! LifecycleCoordinator
//!     → OverlaySlot::get_or_bootstrap (first use only)
//!         → OverlayNetwork::bootstrap(data_dir)  (may take minutes)
//!     → OverlayInstance::open_hidden_listener(spec)
//!         → HiddenListener (local socket the overlay delivers to)
//!     → relay accept loop
//! ```
//!
//! # Design Decisions
//! - The overlay protocol is a black box behind two traits
//! - At most one overlay instance per process, owned by an explicit slot
//!   rather than ambient global state
//! - Teardown is explicit and final: a torn-down slot never bootstraps again

pub mod loopback;
pub mod tor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::config::{OverlayKind, RelayConfig};

pub use loopback::LoopbackOverlay;
pub use tor::TorProcessOverlay;

/// The overlay failed to come up. Fatal to the relay only.
#[derive(Debug, Error)]
pub enum OverlayBootstrapError {
    #[error("cannot prepare overlay directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot launch {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("overlay exited before bootstrapping: {0}")]
    Exited(String),

    #[error("overlay control channel failed: {0}")]
    Control(#[from] std::io::Error),

    #[error("cannot open hidden listener on port {port}: {source}")]
    Listen { port: u16, source: std::io::Error },

    #[error("hidden service was not published: {0}")]
    Publish(String),

    #[error("overlay has been shut down")]
    ShutDown,
}

/// Hidden service to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenServiceSpec {
    /// Name of the service; keys are kept under `data_dir/<service_id>`.
    pub service_id: String,
    /// Port advertised on the overlay.
    pub hidden_port: u16,
    /// Local port the overlay delivers connections to.
    pub local_port: u16,
}

/// A listening socket fed by the overlay.
#[derive(Debug)]
pub struct HiddenListener {
    pub listener: TcpListener,
    /// Overlay address of the service, when known.
    pub address: Option<String>,
}

/// Factory for the overlay; `bootstrap` runs once per process.
pub trait OverlayNetwork: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn bootstrap<'a>(
        &'a self,
        data_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn OverlayInstance>, OverlayBootstrapError>>;
}

/// A bootstrapped overlay.
pub trait OverlayInstance: Send + Sync + 'static {
    fn open_hidden_listener<'a>(
        &'a self,
        spec: &'a HiddenServiceSpec,
    ) -> BoxFuture<'a, Result<HiddenListener, OverlayBootstrapError>>;

    /// Release the overlay. Called once, by the owning slot.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

enum SlotState {
    Empty,
    Ready(Arc<dyn OverlayInstance>),
    TornDown,
}

/// Owner of the single overlay instance.
pub struct OverlaySlot {
    network: Arc<dyn OverlayNetwork>,
    data_dir: PathBuf,
    state: Mutex<SlotState>,
}

impl OverlaySlot {
    pub fn new(network: Arc<dyn OverlayNetwork>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            network,
            data_dir: data_dir.into(),
            state: Mutex::new(SlotState::Empty),
        }
    }

    /// Return the instance, bootstrapping it on first use.
    ///
    /// Concurrent callers wait for the same bootstrap. A failed bootstrap
    /// leaves the slot empty.
    pub async fn get_or_bootstrap(&self) -> Result<Arc<dyn OverlayInstance>, OverlayBootstrapError> {
        let mut state = self.state.lock().await;
        match &*state {
            SlotState::Ready(instance) => return Ok(Arc::clone(instance)),
            SlotState::TornDown => return Err(OverlayBootstrapError::ShutDown),
            SlotState::Empty => {}
        }

        tracing::info!(
            overlay = self.network.name(),
            data_dir = %self.data_dir.display(),
            "Bootstrapping overlay, this may take a while"
        );
        let instance = self.network.bootstrap(&self.data_dir).await?;
        tracing::info!(overlay = self.network.name(), "Overlay bootstrapped");
        *state = SlotState::Ready(Arc::clone(&instance));
        Ok(instance)
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, SlotState::Ready(_))
    }

    /// Shut the instance down, if any. Idempotent.
    pub async fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, SlotState::TornDown);
        if let SlotState::Ready(instance) = previous {
            instance.shutdown().await;
            tracing::info!(overlay = self.network.name(), "Overlay shut down");
        }
    }
}

/// Overlay implementation selected by configuration.
pub fn network_for(config: &RelayConfig) -> Arc<dyn OverlayNetwork> {
    match config.overlay {
        OverlayKind::Tor => Arc::new(TorProcessOverlay::new(config.tor_binary.clone())),
        OverlayKind::Loopback => Arc::new(LoopbackOverlay),
    }
}
