//! Overlay stand-in that publishes the hidden listener on loopback.
//!
//! Used for development and tests, where no anonymity network is available.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;

use super::{HiddenListener, HiddenServiceSpec, OverlayBootstrapError, OverlayInstance, OverlayNetwork};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackOverlay;

impl OverlayNetwork for LoopbackOverlay {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn bootstrap<'a>(
        &'a self,
        _data_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn OverlayInstance>, OverlayBootstrapError>> {
        Box::pin(async { Ok(Arc::new(LoopbackInstance) as Arc<dyn OverlayInstance>) })
    }
}

#[derive(Debug)]
struct LoopbackInstance;

impl OverlayInstance for LoopbackInstance {
    fn open_hidden_listener<'a>(
        &'a self,
        spec: &'a HiddenServiceSpec,
    ) -> BoxFuture<'a, Result<HiddenListener, OverlayBootstrapError>> {
        Box::pin(async move {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, spec.local_port))
                .await
                .map_err(|source| OverlayBootstrapError::Listen {
                    port: spec.local_port,
                    source,
                })?;
            let address = listener.local_addr().ok().map(|addr| addr.to_string());
            Ok(HiddenListener { listener, address })
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_loopback_listener() {
        let instance = LoopbackOverlay.bootstrap(Path::new(".")).await.unwrap();
        let hidden = instance
            .open_hidden_listener(&HiddenServiceSpec {
                service_id: "svc".to_string(),
                hidden_port: 80,
                local_port: 0,
            })
            .await
            .unwrap();
        let addr = hidden.listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(hidden.address, Some(addr.to_string()));
    }
}
