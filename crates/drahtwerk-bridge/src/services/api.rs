// SPDX-License-Identifier: MIT
//
// Local management API.
//
// A small HTTP/1.1 listener independent of the bridge transport, bound to
// loopback by default. It serves the configuration snapshot of the current
// generation and accepts a restart trigger, which exercises the supervisor
// handle from a foreign task. The framing is parsed just enough to route
// three fixed endpoints; a full HTTP server is unnecessary overhead here.
//
//   GET  /config   -> current configuration snapshot (JSON)
//   GET  /version  -> daemon version (JSON)
//   POST /restart  -> flag the supervisor for restart

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drahtwerk_core::VERSION;
use drahtwerk_core::config::BridgeConfig;
use drahtwerk_core::error::{DrahtwerkError, Result};

use crate::services::BridgeService;
use crate::supervisor::SupervisorHandle;

/// Requests are tiny; anything larger is not one of ours.
const MAX_REQUEST_BYTES: usize = 16 * 1024;

pub struct ApiServer {
    bind: String,
    port: u16,
    config_snapshot: Arc<BridgeConfig>,
    handle: SupervisorHandle,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
    local_addr: Arc<StdMutex<Option<SocketAddr>>>,
}

impl ApiServer {
    pub fn new(config: &BridgeConfig, handle: SupervisorHandle) -> Self {
        Self {
            bind: config.api.bind.clone(),
            port: config.api.port,
            config_snapshot: Arc::new(config.clone()),
            handle,
            shutdown: Arc::new(Notify::new()),
            task: None,
            local_addr: Arc::new(StdMutex::new(None)),
        }
    }

    /// The bound address once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|guard| *guard)
    }

    async fn accept_loop(
        listener: TcpListener,
        config: Arc<BridgeConfig>,
        handle: SupervisorHandle,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("management API shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let config = Arc::clone(&config);
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, config, handle).await {
                                    debug!(peer = %peer, error = %e, "API request failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "management API accept failed");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BridgeService for ApiServer {
    fn name(&self) -> &str {
        "api"
    }

    async fn start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.bind, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DrahtwerkError::ServiceStart(format!("API bind {addr}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| DrahtwerkError::ServiceStart(format!("API local addr: {e}")))?;
        if let Ok(mut local_addr) = self.local_addr.lock() {
            *local_addr = Some(bound);
        }
        info!(addr = %bound, "management API listening");

        self.task = Some(tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.config_snapshot),
            self.handle.clone(),
            Arc::clone(&self.shutdown),
        )));
        Ok(())
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config: Arc<BridgeConfig>,
    handle: SupervisorHandle,
) -> Result<()> {
    // Read until the end of headers; none of the endpoints carries a body.
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        if buf.len() >= MAX_REQUEST_BYTES {
            respond(&mut stream, "413 Content Too Large", "{\"error\":\"too large\"}").await?;
            return Ok(());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf);
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();
    debug!(method, path, "API request");

    match (method, path) {
        ("GET", "/config") => {
            let body = serde_json::to_string_pretty(config.as_ref())?;
            respond(&mut stream, "200 OK", &body).await
        }
        ("GET", "/version") => {
            let body = serde_json::json!({ "version": VERSION }).to_string();
            respond(&mut stream, "200 OK", &body).await
        }
        ("POST", "/restart") => {
            info!("restart requested via management API");
            handle.restart();
            respond(&mut stream, "200 OK", "{\"restarting\":true}").await
        }
        _ => respond(&mut stream, "404 Not Found", "{\"error\":\"not found\"}").await,
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
