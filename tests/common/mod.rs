//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hidden_gateway::config::GatewayConfig;
use hidden_gateway::handler::{ApiHandler, ApiRequest, ApiResponse, HandlerError};
use hidden_gateway::http::{build_app, GatewayServer};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Gateway on an ephemeral loopback port, no filters, short drain.
pub fn gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.port = 0;
    config.listener.shutdown_grace_millis = 200;
    config.filters.clear();
    config
}

/// Handler answering with what it was given.
pub fn echo_handler() -> Arc<dyn ApiHandler> {
    Arc::new(|request: ApiRequest| async move {
        Ok::<_, HandlerError>(ApiResponse::ok(json!({
            "path": request.path,
            "method": request.method.as_str(),
            "parameters": request.parameters,
            "client": request.client.ip().to_string(),
        })))
    })
}

/// Handler answering with a large, compressible body.
pub fn bulky_handler(size: usize) -> Arc<dyn ApiHandler> {
    Arc::new(move |_request: ApiRequest| async move {
        Ok::<_, HandlerError>(ApiResponse::ok(json!({ "data": "x".repeat(size) })))
    })
}

/// Handler that takes `delay` before answering.
pub fn slow_handler(delay: Duration) -> Arc<dyn ApiHandler> {
    Arc::new(move |_request: ApiRequest| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, HandlerError>(ApiResponse::ok(json!({ "slept_ms": delay.as_millis() as u64 })))
    })
}

/// Handler that always fails with a message that must not leak.
pub fn failing_handler() -> Arc<dyn ApiHandler> {
    Arc::new(|_request: ApiRequest| async move {
        Err::<ApiResponse, _>(HandlerError::new("database password is hunter2"))
    })
}

pub async fn start_gateway(config: &GatewayConfig, handler: Arc<dyn ApiHandler>) -> (GatewayServer, SocketAddr) {
    let mut server = GatewayServer::new(config.listener.clone(), build_app(config, handler).await);
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// TCP backend echoing every byte back, closing after the client does.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Backend that reads until the client half-closes, then answers with
/// `reply` and closes.
pub async fn start_reply_after_eof_backend(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                if socket.read_to_end(&mut request).await.is_ok() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = socket.write_all(reply).await;
                    let _ = socket.write_all(&request).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
