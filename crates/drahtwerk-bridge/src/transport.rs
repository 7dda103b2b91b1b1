// SPDX-License-Identifier: MIT
//
// WebSocket gateway transport.
//
// One TCP listener multiplexes every hardware channel: a client connects to
// `ws://host:port/{channel}` (e.g. `/serial/scale`, `/printer`) and the
// request path selects the attached [`ChannelHandler`]. Adapters push
// unsolicited frames to all clients of their channel via
// [`Transport::broadcast`].
//
// The listener binds with address reuse so a restarted generation can rebind
// immediately. Silent peers are pinged after the idle window and dropped
// after a second silent window (default 3 s each).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::{debug, error, info, warn};

use drahtwerk_core::error::{DrahtwerkError, Result};
use drahtwerk_core::types::ServiceStatus;

/// Idle window after which a silent peer is pinged, and after a second
/// window, dropped.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Network listener adapters attach their channels to.
///
/// The supervisor drives the lifecycle: `attach`/`set_tls` are called while
/// the transport is cold, then `start`, and at teardown `close_connections`
/// strictly before `stop`. Adapters only ever use `attach` and `broadcast`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Register the handler for a channel path. Call before [`start`](Transport::start).
    fn attach(&self, channel: &str, handler: Arc<dyn ChannelHandler>);

    /// Install the secure connection factory. Call before [`start`](Transport::start).
    fn set_tls(&self, acceptor: TlsAcceptor);

    /// Bind the listener and begin accepting clients.
    async fn start(&self) -> Result<()>;

    /// Push a text frame to every client attached to `channel`.
    async fn broadcast(&self, channel: &str, text: String);

    /// Close all active client connections.
    async fn close_connections(&self);

    /// Stop the listener. Only call after
    /// [`close_connections`](Transport::close_connections).
    async fn stop(&self) -> Result<()>;
}

/// Per-channel message sink, implemented by each adapter.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_message(&self, client: ClientHandle, text: String);
}

/// Reply handle for one connected client.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    tx: mpsc::Sender<Message>,
}

impl ClientHandle {
    pub(crate) fn new(id: u64, tx: mpsc::Sender<Message>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a text frame to this client. A closed connection is reported as
    /// a transport error.
    pub async fn send(&self, text: String) -> Result<()> {
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(|_| DrahtwerkError::Transport("client connection closed".into()))
    }
}

struct ConnEntry {
    channel: String,
    tx: mpsc::Sender<Message>,
}

/// Production transport: one tokio TCP listener, WebSocket upgrade per
/// connection, optional TLS.
pub struct WsTransport {
    bind: String,
    port: u16,
    idle_timeout: Duration,
    status: StdMutex<ServiceStatus>,
    channels: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandler>>>>,
    tls: StdMutex<Option<TlsAcceptor>>,
    conns: Arc<Mutex<HashMap<u64, ConnEntry>>>,
    next_conn_id: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl WsTransport {
    pub fn new(bind: &str, port: u16) -> Self {
        Self {
            bind: bind.to_string(),
            port,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            status: StdMutex::new(ServiceStatus::Stopped),
            channels: Arc::new(RwLock::new(HashMap::new())),
            tls: StdMutex::new(None),
            conns: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            shutdown: Arc::new(Notify::new()),
            accept_task: StdMutex::new(None),
            local_addr: StdMutex::new(None),
        }
    }

    /// Override the idle-connection timeout (tests use short windows).
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// The bound address once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|guard| *guard)
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ServiceStatus::Error)
    }

    fn set_status(&self, status: ServiceStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    async fn accept_loop(
        listener: tokio::net::TcpListener,
        tls: Option<TlsAcceptor>,
        channels: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandler>>>>,
        conns: Arc<Mutex<HashMap<u64, ConnEntry>>>,
        next_conn_id: Arc<AtomicU64>,
        idle_timeout: Duration,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "incoming connection");
                            let tls = tls.clone();
                            let channels = Arc::clone(&channels);
                            let conns = Arc::clone(&conns);
                            let id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                let served = match tls {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(secured) => {
                                            serve_socket(secured, peer, id, channels, conns, idle_timeout).await
                                        }
                                        Err(e) => {
                                            warn!(peer = %peer, error = %e, "TLS handshake failed");
                                            return;
                                        }
                                    },
                                    None => serve_socket(stream, peer, id, channels, conns, idle_timeout).await,
                                };
                                if let Err(e) = served {
                                    debug!(peer = %peer, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn attach(&self, channel: &str, handler: Arc<dyn ChannelHandler>) {
        info!(channel, "channel attached");
        if let Ok(mut channels) = self.channels.write() {
            channels.insert(channel.to_string(), handler);
        } else {
            error!(channel, "channel registry poisoned, handler not attached");
        }
    }

    fn set_tls(&self, acceptor: TlsAcceptor) {
        info!("secure connection factory installed");
        if let Ok(mut tls) = self.tls.lock() {
            *tls = Some(acceptor);
        } else {
            error!("TLS slot poisoned, acceptor not installed");
        }
    }

    async fn start(&self) -> Result<()> {
        if self.status() == ServiceStatus::Running {
            debug!("transport already running");
            return Ok(());
        }
        self.set_status(ServiceStatus::Starting);

        let addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| DrahtwerkError::Transport(format!("bad bind address: {e}")))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| DrahtwerkError::Transport(format!("socket: {e}")))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| DrahtwerkError::Transport(format!("reuseaddr: {e}")))?;
        socket
            .bind(addr)
            .map_err(|e| DrahtwerkError::Transport(format!("bind {addr}: {e}")))?;
        let listener = socket
            .listen(128)
            .map_err(|e| DrahtwerkError::Transport(format!("listen {addr}: {e}")))?;

        let bound = listener
            .local_addr()
            .map_err(|e| DrahtwerkError::Transport(format!("local addr: {e}")))?;
        if let Ok(mut local_addr) = self.local_addr.lock() {
            *local_addr = Some(bound);
        }
        info!(addr = %bound, "transport listening");

        // The factory set is frozen at start; set_tls after start has no
        // effect, matching the supervisor's ordering.
        let tls = self
            .tls
            .lock()
            .map_err(|_| DrahtwerkError::Transport("TLS slot poisoned".into()))?
            .clone();

        let handle = tokio::spawn(Self::accept_loop(
            listener,
            tls,
            Arc::clone(&self.channels),
            Arc::clone(&self.conns),
            Arc::clone(&self.next_conn_id),
            self.idle_timeout,
            Arc::clone(&self.shutdown),
        ));
        if let Ok(mut task) = self.accept_task.lock() {
            *task = Some(handle);
        }
        self.set_status(ServiceStatus::Running);
        Ok(())
    }

    async fn broadcast(&self, channel: &str, text: String) {
        // Snapshot the senders so the registry lock is never held across a
        // send; try_send keeps one stalled peer from blocking the rest.
        let targets: Vec<mpsc::Sender<Message>> = {
            let conns = self.conns.lock().await;
            conns
                .values()
                .filter(|e| e.channel == channel)
                .map(|e| e.tx.clone())
                .collect()
        };
        for tx in targets {
            if tx.try_send(Message::Text(text.clone())).is_err() {
                debug!(channel, "dropping frame for slow or closed connection");
            }
        }
    }

    async fn close_connections(&self) {
        let drained: Vec<ConnEntry> = {
            let mut conns = self.conns.lock().await;
            conns.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            if entry.tx.try_send(Message::Close(None)).is_err() {
                // Queue full: the peer stopped reading and the idle policy
                // will drop it; deregistering is enough here.
                debug!(channel = %entry.channel, "stalled connection deregistered without close frame");
            }
        }
        if count > 0 {
            info!(count, "active connections closed");
        }
    }

    async fn stop(&self) -> Result<()> {
        // notify_one stores a permit, so the signal is not lost even when
        // the accept loop has not been polled yet.
        self.shutdown.notify_one();
        let task = self
            .accept_task
            .lock()
            .map_err(|_| DrahtwerkError::Transport("accept task slot poisoned".into()))?
            .take();
        if let Some(task) = task {
            task.await
                .map_err(|e| DrahtwerkError::Transport(format!("accept task join: {e}")))?;
        }
        self.set_status(ServiceStatus::Stopped);
        info!("transport stopped");
        Ok(())
    }
}

/// Serve one upgraded connection until it closes or goes silent.
async fn serve_socket<S>(
    stream: S,
    peer: SocketAddr,
    id: u64,
    channels: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandler>>>>,
    conns: Arc<Mutex<HashMap<u64, ConnEntry>>>,
    idle_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut path = String::new();
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok::<_, ErrorResponse>(resp)
    })
    .await
    .map_err(|e| DrahtwerkError::Transport(format!("handshake with {peer}: {e}")))?;

    let handler = channels
        .read()
        .ok()
        .and_then(|channels| channels.get(&path).cloned());
    let Some(handler) = handler else {
        warn!(peer = %peer, path, "no channel attached at path, closing");
        return Ok(());
    };

    info!(peer = %peer, channel = %path, "client attached");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(32);
    conns.lock().await.insert(
        id,
        ConnEntry {
            channel: path.clone(),
            tx: tx.clone(),
        },
    );

    // Writer half: drains the outbound queue; a Close frame ends it.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader half with the idle-peer policy: ping once after a silent
    // window, drop after a second one.
    let mut pinged = false;
    loop {
        match timeout(idle_timeout, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => {
                pinged = false;
                match msg {
                    Message::Text(text) => {
                        let client = ClientHandle::new(id, tx.clone());
                        handler.on_message(client, text).await;
                    }
                    Message::Binary(_) => {
                        warn!(peer = %peer, "unexpected binary frame (ignored)");
                    }
                    Message::Close(_) => break,
                    // Ping/Pong are answered by tungstenite itself.
                    _ => {}
                }
            }
            Ok(Some(Err(e))) => {
                debug!(peer = %peer, error = %e, "read error");
                break;
            }
            Ok(None) => break,
            Err(_) if !pinged => {
                pinged = true;
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                debug!(peer = %peer, "silent peer dropped");
                break;
            }
        }
    }

    conns.lock().await.remove(&id);
    drop(tx);
    let _ = writer.await;
    info!(peer = %peer, channel = %path, "client detached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;
    use tokio_tungstenite::connect_async;

    /// Handler that echoes every message back and records it.
    struct EchoHandler {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelHandler for EchoHandler {
        async fn on_message(&self, client: ClientHandle, text: String) {
            self.seen.lock().unwrap().push(text.clone());
            let _ = client.send(format!("echo:{text}")).await;
        }
    }

    async fn started_transport() -> (Arc<WsTransport>, Arc<EchoHandler>, String) {
        let transport = Arc::new(WsTransport::new("127.0.0.1", 0));
        let handler = Arc::new(EchoHandler {
            seen: StdMutex::new(Vec::new()),
        });
        transport.attach("/serial/scale", handler.clone());
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, handler, format!("ws://{addr}"))
    }

    #[tokio::test]
    async fn routes_messages_by_request_path() {
        let (transport, handler, base) = started_transport().await;

        let (mut ws, _) = connect_async(format!("{base}/serial/scale")).await.unwrap();
        ws.send(Message::Text("TARE".into())).await.unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply, Message::Text("echo:TARE".into()));
        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["TARE"]);

        transport.close_connections().await;
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_channel_clients_only() {
        let (transport, _handler, base) = started_transport().await;
        let quiet = Arc::new(EchoHandler {
            seen: StdMutex::new(Vec::new()),
        });
        transport.attach("/printer", quiet);

        let (mut on_channel, _) = connect_async(format!("{base}/serial/scale")).await.unwrap();
        let (mut off_channel, _) = connect_async(format!("{base}/printer")).await.unwrap();

        // Make sure both connections are registered before broadcasting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.broadcast("/serial/scale", "WEIGHT 12.5".into()).await;

        let got = on_channel.next().await.unwrap().unwrap();
        assert_eq!(got, Message::Text("WEIGHT 12.5".into()));

        // The other channel sees nothing within a short window.
        let nothing = timeout(Duration::from_millis(100), off_channel.next()).await;
        assert!(nothing.is_err());

        transport.close_connections().await;
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_path_is_closed_immediately() {
        let (transport, _handler, base) = started_transport().await;

        let (mut ws, _) = connect_async(format!("{base}/nope")).await.unwrap();
        // Server closes right after the handshake.
        let next = ws.next().await;
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));

        transport.close_connections().await;
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn close_connections_then_stop() {
        let (transport, _handler, base) = started_transport().await;
        let (mut ws, _) = connect_async(format!("{base}/serial/scale")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.close_connections().await;
        // The client observes a close frame (or the stream ending).
        let next = timeout(Duration::from_secs(1), ws.next()).await.unwrap();
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_idle_windows() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let transport = Arc::new(
            WsTransport::new("127.0.0.1", 0).with_idle_timeout(Duration::from_millis(100)),
        );
        let handler = Arc::new(EchoHandler {
            seen: StdMutex::new(Vec::new()),
        });
        transport.attach("/serial/scale", handler);
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        // Raw client that upgrades by hand and then never answers the
        // server's keepalive ping (a real client library would pong for us).
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let upgrade = format!(
            "GET /serial/scale HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        raw.write_all(upgrade.as_bytes()).await.unwrap();

        // Read until the server hangs up; it must do so well within a
        // couple of idle windows.
        let dropped = timeout(Duration::from_secs(2), async {
            let mut buf = [0u8; 512];
            loop {
                match raw.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(dropped.is_ok(), "server never dropped the silent peer");

        transport.close_connections().await;
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_completes_even_if_requested_immediately_after_start() {
        // On a current-thread runtime the accept loop has not been polled
        // yet when stop is called; the shutdown signal must still land.
        let transport = WsTransport::new("127.0.0.1", 0);
        transport.start().await.unwrap();
        timeout(Duration::from_secs(1), transport.stop())
            .await
            .expect("stop did not finish")
            .unwrap();
    }

    #[tokio::test]
    async fn teardown_is_not_blocked_by_a_peer_that_stops_reading() {
        use tokio::io::AsyncWriteExt;

        let (transport, _handler, _base) = started_transport().await;
        let addr = transport.local_addr().unwrap();

        // Hand-rolled upgrade; after the handshake the peer never reads,
        // so its socket and outbound queue fill up under the flood below.
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let upgrade = format!(
            "GET /serial/scale HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        raw.write_all(upgrade.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = "x".repeat(1024 * 1024);
        let teardown = timeout(Duration::from_secs(2), async {
            for _ in 0..64 {
                transport.broadcast("/serial/scale", frame.clone()).await;
            }
            transport.close_connections().await;
            transport.stop().await
        })
        .await;
        assert!(teardown.is_ok(), "teardown stalled behind an unread socket");
        teardown.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_follows_start_and_stop() {
        let transport = WsTransport::new("127.0.0.1", 0);
        assert_eq!(transport.status(), ServiceStatus::Stopped);

        transport.start().await.unwrap();
        assert_eq!(transport.status(), ServiceStatus::Running);

        // A second start is a no-op while running.
        transport.start().await.unwrap();
        assert_eq!(transport.status(), ServiceStatus::Running);

        transport.stop().await.unwrap();
        assert_eq!(transport.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn rebind_same_port_across_generations() {
        let (transport, _handler, _base) = started_transport().await;
        let port = transport.local_addr().unwrap().port();
        transport.close_connections().await;
        transport.stop().await.unwrap();

        // A fresh generation binds the same port thanks to reuseaddr.
        let second = WsTransport::new("127.0.0.1", port);
        second.start().await.unwrap();
        second.close_connections().await;
        second.stop().await.unwrap();
    }
}
