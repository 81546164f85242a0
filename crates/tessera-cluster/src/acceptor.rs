//! Client-facing acceptor: raw TCP, WebSocket, or WebSocket over TLS.
//!
//! Whatever the transport, each accepted connection reaches the
//! [`ConnectionHandler`] as a plain byte stream on its own task. WebSocket
//! binary and text frames are unwrapped into that stream; bytes the
//! handler writes go back out as binary frames.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router as HttpRouter;
use axum::extract::connect_info::Connected;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::serve::IncomingStream;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, TransportKind};
use crate::error::{ClusterError, ClusterResult};
use crate::handler::ConnectionHandler;
use crate::tls::{self, TlsListener};

/// Size of the in-memory pipe between a WebSocket and its handler.
const WS_PIPE_CAPACITY: usize = 64 * 1024;

/// A running acceptor.
pub struct AcceptorHandle {
    local_addr: SocketAddr,
    transport: TransportKind,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AcceptorHandle {
    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Stop accepting and wait for the accept loop to exit. Connections
    /// already handed off keep running until their peers disconnect.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "acceptor task ended abnormally");
        }
        info!(addr = %self.local_addr, "acceptor stopped");
    }
}

/// A client listener that is bound but not yet accepting.
///
/// Binding and TLS loading happen in [`bind`], before the node joins the
/// cluster, so a busy port or unusable TLS material never leaves a
/// registration behind.
pub struct BoundAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    transport: TransportKind,
    tls: Option<Arc<rustls::ServerConfig>>,
    ws_path: String,
    allowed_origins: Vec<String>,
}

/// Bind the transport selected by `config` without accepting yet.
pub async fn bind(config: &NodeConfig) -> ClusterResult<BoundAcceptor> {
    let tls = match config.transport {
        TransportKind::Wss => {
            let (cert, key) = match (&config.tls_cert, &config.tls_key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(ClusterError::Transport(
                        "wss transport requires both tls_cert and tls_key".to_string(),
                    ));
                }
            };
            let tls_config = tls::load_server_config(cert, key)
                .map_err(|e| ClusterError::Transport(e.to_string()))?;
            Some(tls_config)
        }
        TransportKind::Tcp | TransportKind::Ws => None,
    };

    let listener = TcpListener::bind(&config.server_addr).await.map_err(|e| {
        ClusterError::Transport(format!("bind client listener {}: {e}", config.server_addr))
    })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ClusterError::Transport(format!("client listener address: {e}")))?;
    debug!(addr = %local_addr, transport = ?config.transport, "client listener bound");

    Ok(BoundAcceptor {
        listener,
        local_addr,
        transport: config.transport,
        tls,
        ws_path: config.normalized_ws_path(),
        allowed_origins: config.allowed_origins.clone(),
    })
}

/// Bind the transport selected by `config` and start accepting.
pub async fn start(
    config: &NodeConfig,
    handler: Arc<dyn ConnectionHandler>,
) -> ClusterResult<AcceptorHandle> {
    bind(config).await?.start(handler)
}

impl BoundAcceptor {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections on the bound listener.
    pub fn start(self, handler: Arc<dyn ConnectionHandler>) -> ClusterResult<AcceptorHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let transport = self.transport;

        let task = match (transport, self.tls) {
            (TransportKind::Tcp, _) => tokio::spawn(run_tcp(self.listener, handler, shutdown_rx)),
            (TransportKind::Ws, _) => {
                let app = ws_app(&self.ws_path, self.allowed_origins, handler);
                let listener = self.listener;
                tokio::spawn(async move {
                    let serve = axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<PeerAddr>(),
                    )
                    .with_graceful_shutdown(wait_for(shutdown_rx));
                    if let Err(e) = serve.await {
                        error!(error = %e, "websocket server failed");
                    }
                })
            }
            (TransportKind::Wss, Some(tls_config)) => {
                let listener = TlsListener::new(self.listener, tls_config)
                    .map_err(|e| ClusterError::Transport(format!("TLS listener: {e}")))?;
                let app = ws_app(&self.ws_path, self.allowed_origins, handler);
                tokio::spawn(async move {
                    let serve = axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<PeerAddr>(),
                    )
                    .with_graceful_shutdown(wait_for(shutdown_rx));
                    if let Err(e) = serve.await {
                        error!(error = %e, "secure websocket server failed");
                    }
                })
            }
            (TransportKind::Wss, None) => {
                return Err(ClusterError::Transport(
                    "wss transport bound without TLS configuration".to_string(),
                ));
            }
        };

        info!(addr = %local_addr, ?transport, "acceptor listening");
        Ok(AcceptorHandle {
            local_addr,
            transport,
            shutdown_tx,
            task,
        })
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_tcp(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted tcp connection");
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle(Box::new(stream), peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("tcp acceptor shutting down");
                break;
            }
        }
    }
}

/// Remote address of a WebSocket client, for plain and TLS listeners alike.
#[derive(Debug, Clone, Copy)]
struct PeerAddr(SocketAddr);

impl Connected<IncomingStream<'_, TcpListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

#[derive(Clone)]
struct WsState {
    handler: Arc<dyn ConnectionHandler>,
    allowed_origins: Arc<Vec<String>>,
}

fn ws_app(path: &str, allowed_origins: Vec<String>, handler: Arc<dyn ConnectionHandler>) -> HttpRouter {
    let state = WsState {
        handler,
        allowed_origins: Arc::new(allowed_origins),
    };
    HttpRouter::new()
        .route(path, get(upgrade))
        .with_state(state)
}

/// An empty allow-list accepts every origin, as does a request without an
/// `Origin` header.
fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(origin) => allowed.iter().any(|a| a == "*" || a.eq_ignore_ascii_case(origin)),
    }
}

async fn upgrade(
    State(state): State<WsState>,
    ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&state.allowed_origins, &headers) {
        warn!(%peer, "websocket origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_failed_upgrade(move |e| warn!(%peer, error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| bridge(socket, state.handler, peer))
}

/// Pump frames between the socket and an in-memory pipe whose other end
/// is the handler's connection.
async fn bridge(mut socket: WebSocket, handler: Arc<dyn ConnectionHandler>, peer: SocketAddr) {
    debug!(%peer, "accepted websocket connection");
    let (local, mut pipe) = tokio::io::duplex(WS_PIPE_CAPACITY);
    let conn = tokio::spawn(async move {
        handler.handle(Box::new(local), peer).await;
    });

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let data = match incoming {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(%peer, error = %e, "websocket read failed");
                        break;
                    }
                };
                if pipe.write_all(&data).await.is_err() {
                    break;
                }
            }
            outgoing = pipe.read(&mut buf) => {
                match outgoing {
                    Ok(0) | Err(_) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    Ok(n) => {
                        if socket.send(Message::Binary(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    drop(pipe);
    let _ = conn.await;
    debug!(%peer, "websocket connection closed");
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn origin_policy() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://game.example"));

        assert!(origin_allowed(&[], &headers));
        assert!(origin_allowed(&["https://game.example".to_string()], &headers));
        assert!(origin_allowed(&["*".to_string()], &headers));
        assert!(!origin_allowed(&["https://other.example".to_string()], &headers));
        assert!(origin_allowed(&["https://other.example".to_string()], &HeaderMap::new()));
    }

    struct Noop;

    impl ConnectionHandler for Noop {
        fn handle<'a>(
            &'a self,
            _conn: crate::handler::Connection,
            _peer: SocketAddr,
        ) -> crate::handler::ConnectionFuture<'a> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn busy_port_is_transport_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = NodeConfig::standalone(&taken.local_addr().unwrap().to_string());
        config.transport = TransportKind::Tcp;

        let err = start(&config, Arc::new(Noop)).await.err().unwrap();
        assert!(matches!(err, ClusterError::Transport(_)));
    }

    #[tokio::test]
    async fn bound_port_is_held_until_started() {
        let bound = bind(&NodeConfig::standalone("127.0.0.1:0")).await.unwrap();
        let addr = bound.local_addr();
        assert!(std::net::TcpListener::bind(addr).is_err());

        let handle = bound.start(Arc::new(Noop)).unwrap();
        assert_eq!(handle.local_addr(), addr);
        tokio::net::TcpStream::connect(addr).await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unusable_tls_material_fails_bind() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::standalone("127.0.0.1:0");
        config.transport = TransportKind::Wss;
        config.tls_cert = Some(dir.path().join("missing.pem"));
        config.tls_key = Some(dir.path().join("missing.key"));

        let err = bind(&config).await.err().unwrap();
        assert!(matches!(err, ClusterError::Transport(_)));
    }
}
