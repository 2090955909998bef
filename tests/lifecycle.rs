//! Coordinator integration tests: gateway plus relay over the loopback overlay.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use hidden_gateway::config::GatewayConfig;
use hidden_gateway::lifecycle::{LifecycleCoordinator, LifecycleError, Phase};
use hidden_gateway::overlay::{LoopbackOverlay, OverlayBootstrapError, OverlayInstance, OverlayNetwork};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

fn relay_enabled() -> GatewayConfig {
    let mut config = common::gateway_config();
    config.relay.enabled = true;
    config.relay.listen_port = 0;
    config.relay.drain_grace_millis = 200;
    config
}

struct BrokenOverlay;

impl OverlayNetwork for BrokenOverlay {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn bootstrap<'a>(
        &'a self,
        _data_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn OverlayInstance>, OverlayBootstrapError>> {
        Box::pin(async { Err(OverlayBootstrapError::Exited("no route to directory".to_string())) })
    }
}

struct StuckOverlay;

impl OverlayNetwork for StuckOverlay {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn bootstrap<'a>(
        &'a self,
        _data_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn OverlayInstance>, OverlayBootstrapError>> {
        Box::pin(std::future::pending())
    }
}

#[tokio::test]
async fn hidden_client_reaches_the_api() {
    let coordinator = LifecycleCoordinator::new(
        relay_enabled(),
        common::echo_handler(),
        Arc::new(LoopbackOverlay),
    );
    coordinator.start().await.unwrap();
    assert_eq!(coordinator.phase().await, Phase::RelayRunning);

    let relay = coordinator.relay_addr().await.unwrap();
    let mut client = TcpStream::connect(relay).await.unwrap();
    client
        .write_all(b"GET /burst/peers?requestType=getState HTTP/1.1\r\nHost: gateway\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("response should arrive")
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"path\":\"/peers\""));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn shutdown_twice_is_harmless() {
    let coordinator = LifecycleCoordinator::new(
        relay_enabled(),
        common::echo_handler(),
        Arc::new(LoopbackOverlay),
    );
    coordinator.start().await.unwrap();
    let gateway = coordinator.gateway_addr().await.unwrap();
    let relay = coordinator.relay_addr().await.unwrap();

    coordinator.shutdown().await;
    assert_eq!(coordinator.phase().await, Phase::Stopped);
    coordinator.shutdown().await;
    assert_eq!(coordinator.phase().await, Phase::Stopped);

    assert!(TcpStream::connect(gateway).await.is_err());
    assert!(TcpStream::connect(relay).await.is_err());
}

#[tokio::test]
async fn overlay_failure_keeps_the_gateway_serving() {
    let coordinator = LifecycleCoordinator::new(
        relay_enabled(),
        common::echo_handler(),
        Arc::new(BrokenOverlay),
    );
    coordinator.start().await.unwrap();
    assert_eq!(coordinator.phase().await, Phase::GatewayRunning);
    assert!(coordinator.relay_addr().await.is_none());

    let gateway = coordinator.gateway_addr().await.unwrap();
    let response = common::http_client()
        .get(format!("http://{gateway}/burst"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn listener_failure_stops_everything() {
    let mut config = relay_enabled();
    config.listener.tls_enabled = true;
    config.listener.tls_keystore_path = "/nonexistent/keystore.pem".to_string();
    let coordinator =
        LifecycleCoordinator::new(config, common::echo_handler(), Arc::new(LoopbackOverlay));

    assert!(matches!(coordinator.start().await, Err(LifecycleError::Gateway(_))));
    assert_eq!(coordinator.phase().await, Phase::Stopped);
    assert!(coordinator.gateway_addr().await.is_none());
    coordinator.shutdown().await;
    assert_eq!(coordinator.phase().await, Phase::Stopped);
}

#[tokio::test]
async fn shutdown_interrupts_a_pending_bootstrap() {
    let coordinator = Arc::new(LifecycleCoordinator::new(
        relay_enabled(),
        common::echo_handler(),
        Arc::new(StuckOverlay),
    ));
    let starting = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.start().await }
    });

    // Wait until the gateway is up and the bootstrap is underway.
    for _ in 0..50 {
        if coordinator.gateway_addr().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let gateway = coordinator.gateway_addr().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
        .await
        .expect("shutdown should not wait for the bootstrap");
    let started = tokio::time::timeout(Duration::from_secs(5), starting)
        .await
        .expect("start should return once shut down")
        .unwrap();
    assert!(started.is_ok());
    assert_eq!(coordinator.phase().await, Phase::Stopped);
    assert!(TcpStream::connect(gateway).await.is_err());
}
