//! HTTP server lifecycle
//!
//! [`HttpServer::start`] binds a listener and returns a [`ServerHandle`]; the
//! handle is the only way to stop it. [`ServerManager`] owns at most one
//! handle so that starting again replaces the running instance instead of
//! racing it for the port.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use inference::constants::{hosts, timeouts};
use inference::{LogBuffer, SharedBridge};
use serde::Serialize;
use sysinfo::Networks;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::routes::{build_router, AppState};

/// Errors raised while starting the server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read local address: {0}")]
    LocalAddr(std::io::Error),
}

/// First non-loopback IPv4 address of this machine, else `localhost`.
///
/// Interfaces are visited in name order so the answer is stable.
pub fn resolve_address() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks.list().iter().collect();
    interfaces.sort_by(|a, b| a.0.cmp(b.0));

    interfaces
        .into_iter()
        .flat_map(|(_, data)| data.ip_networks().iter())
        .find_map(|net| match net.addr {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified() => {
                Some(v4.to_string())
            }
            _ => None,
        })
        .unwrap_or_else(|| hosts::LOCALHOST.to_string())
}

/// Address clients should use to reach a server bound to `host`
fn advertised_address(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => resolve_address(),
        _ => host.to_string(),
    }
}

pub struct HttpServer;

impl HttpServer {
    /// Bind and start serving in the background
    pub async fn start(
        config: &ServerConfig,
        bridge: SharedBridge,
    ) -> Result<ServerHandle, ServerError> {
        let bind_addr = config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let logs = bridge.logs().clone();
        let app = build_router(AppState {
            bridge,
            stream_capacity: config.stream_queue_capacity,
            chunk_timeout: config.chunk_timeout(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            // A dropped sender counts as a shutdown request too
            let signal = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                log::error!("HTTP server error: {}", e);
            }
        });

        let address = advertised_address(&config.host);
        logs.push(format!(
            "Server started on http://{}:{}",
            address,
            local_addr.port()
        ));

        Ok(ServerHandle {
            local_addr,
            address,
            logs,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Owned handle to a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    address: String,
    logs: Arc<LogBuffer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Advertised host (LAN address or `localhost`)
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port())
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop accepting connections and wait for in-flight ones, at most
    /// `SERVER_STOP_SECS`, before aborting. Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        let grace = Duration::from_secs(timeouts::SERVER_STOP_SECS);
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            log::warn!("Server did not stop within {}s, aborting", grace.as_secs());
            task.abort();
        }

        self.logs.push("Server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Snapshot of the server for status queries
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub address: Option<String>,
    /// Newest first
    pub logs: Vec<String>,
}

/// Owner of at most one running server
pub struct ServerManager {
    bridge: SharedBridge,
    current: Mutex<Option<ServerHandle>>,
}

impl ServerManager {
    pub fn new(bridge: SharedBridge) -> Self {
        Self {
            bridge,
            current: Mutex::new(None),
        }
    }

    /// Start a server, stopping the previous one first
    pub async fn start(&self, config: &ServerConfig) -> Result<ServerStatus, ServerError> {
        let mut current = self.current.lock().await;
        if let Some(mut previous) = current.take() {
            log::info!("Stopping previous server on port {}", previous.port());
            previous.stop().await;
        }

        let handle = HttpServer::start(config, self.bridge.clone()).await?;
        log::info!("Serving on {}", handle.url());
        *current = Some(handle);

        Ok(self.status_of(current.as_ref()))
    }

    pub async fn stop(&self) {
        if let Some(mut handle) = self.current.lock().await.take() {
            handle.stop().await;
        }
    }

    pub async fn status(&self) -> ServerStatus {
        let current = self.current.lock().await;
        self.status_of(current.as_ref())
    }

    fn status_of(&self, handle: Option<&ServerHandle>) -> ServerStatus {
        ServerStatus {
            running: handle.is_some_and(ServerHandle::is_running),
            port: handle.map(ServerHandle::port),
            address: handle.map(|h| h.address().to_string()),
            logs: self.bridge.logs().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference::session::ScriptedSession;
    use inference::GenerationBridge;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    fn bridge() -> SharedBridge {
        let session = Arc::new(ScriptedSession::new("stub", ["Hello", "!"]));
        Arc::new(GenerationBridge::new(session, Arc::new(LogBuffer::new())))
    }

    async fn is_reachable(port: u16) -> bool {
        reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/v1/models", port))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }

    #[test]
    fn test_advertised_address() {
        assert_eq!(advertised_address("127.0.0.1"), "127.0.0.1");
        assert_eq!(advertised_address("my-host"), "my-host");

        let resolved = advertised_address("0.0.0.0");
        assert!(resolved == "localhost" || resolved.parse::<std::net::Ipv4Addr>().is_ok());
    }

    #[tokio::test]
    async fn test_serves_over_loopback() {
        let mut handle = HttpServer::start(&loopback_config(), bridge()).await.unwrap();
        assert!(handle.is_running());
        assert_ne!(handle.port(), 0);
        assert_eq!(handle.address(), "127.0.0.1");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://127.0.0.1:{}/v1/chat/completions", handle.port()))
            .json(&serde_json::json!({
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["choices"][0]["message"]["content"], "Hello!");

        let response = client
            .post(format!("http://127.0.0.1:{}/v1/chat/completions", handle.port()))
            .json(&serde_json::json!({
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }))
            .send()
            .await
            .unwrap();
        let body = response.text().await.unwrap();
        assert!(body.ends_with("data: [DONE]\n\n"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let bridge = bridge();
        let logs = bridge.logs().clone();
        let mut handle = HttpServer::start(&loopback_config(), bridge).await.unwrap();
        let port = handle.port();

        handle.stop().await;
        handle.stop().await;

        assert!(!handle.is_running());
        assert!(!is_reachable(port).await);

        let entries = logs.snapshot();
        assert_eq!(entries.iter().filter(|e| e.ends_with("Server stopped")).count(), 1);
        assert!(entries
            .iter()
            .any(|e| e.contains(&format!("Server started on http://127.0.0.1:{}", port))));
    }

    #[tokio::test]
    async fn test_drop_shuts_down() {
        let handle = HttpServer::start(&loopback_config(), bridge()).await.unwrap();
        let port = handle.port();
        assert!(is_reachable(port).await);
        drop(handle);

        let mut stopped = false;
        for _ in 0..50 {
            if !is_reachable(port).await {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let mut first = HttpServer::start(&loopback_config(), bridge()).await.unwrap();
        let taken = ServerConfig {
            port: first.port(),
            ..loopback_config()
        };

        let err = HttpServer::start(&taken, bridge()).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_manager_restart_replaces_previous() {
        let manager = ServerManager::new(bridge());

        let status = manager.start(&loopback_config()).await.unwrap();
        assert!(status.running);
        let port = status.port.unwrap();

        // Same port again: only works if the first listener was released
        let same_port = ServerConfig {
            port,
            ..loopback_config()
        };
        let status = manager.start(&same_port).await.unwrap();
        assert!(status.running);
        assert_eq!(status.port, Some(port));
        assert!(is_reachable(port).await);

        manager.stop().await;
        let status = manager.status().await;
        assert!(!status.running);
        assert_eq!(status.port, None);
        assert!(status.logs[0].ends_with("Server stopped"));
        assert!(!is_reachable(port).await);

        // Stopping with nothing running is a no-op
        manager.stop().await;
    }

    #[test]
    fn test_status_serializes() {
        let status = ServerStatus {
            running: true,
            port: Some(8080),
            address: Some("192.168.1.20".to_string()),
            logs: vec!["12:00:00 Server started on http://192.168.1.20:8080".to_string()],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["port"], 8080);
        assert_eq!(json["address"], "192.168.1.20");
    }
}
