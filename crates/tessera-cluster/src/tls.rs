//! TLS for the secure WebSocket transport.
//!
//! Loads a PEM certificate chain and private key into a rustls server
//! config, and wraps a TCP listener so that every accepted stream is a
//! completed TLS session.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// Upper bound on a single TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a rustls server config from PEM files.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> ClusterResult<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        ClusterError::Config(format!("open TLS cert {}: {e}", cert_path.display()))
    })?;
    let key_file = std::fs::File::open(key_path).map_err(|e| {
        ClusterError::Config(format!("open TLS key {}: {e}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Config(format!("read TLS cert: {e}")))?;
    if certs.is_empty() {
        return Err(ClusterError::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ClusterError::Config(format!("read TLS key: {e}")))?
        .ok_or_else(|| {
            ClusterError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::Config(format!("TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ClusterError::Config(format!("invalid TLS configuration: {e}")))?;

    info!(cert = %cert_path.display(), "loaded TLS certificate");
    Ok(Arc::new(config))
}

/// Completed handshakes waiting for `accept`.
const READY_QUEUE: usize = 64;

/// TCP listener that yields TLS streams. Each handshake runs on its own
/// task, so a peer that stalls mid-handshake holds up nobody else. Failed
/// handshakes are logged and skipped; `accept` only returns established
/// sessions.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    /// Start handshaking connections from `inner`. Must be called within a
    /// tokio runtime.
    pub fn new(inner: TcpListener, config: Arc<rustls::ServerConfig>) -> std::io::Result<Self> {
        let local_addr = inner.local_addr()?;
        let (tx, ready) = mpsc::channel(READY_QUEUE);
        let accept_task = tokio::spawn(accept_loop(inner, TlsAcceptor::from(config), tx));
        Ok(Self {
            local_addr,
            ready,
            accept_task,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "TLS listener accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = ready.closed() => return,
        };

        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    if ready.send((tls, peer)).await.is_err() {
                        debug!(%peer, "TLS listener closed before session was taken");
                    }
                }
                Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%peer, "TLS handshake timed out"),
            }
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(session) => session,
            // The sender lives in the accept task, which only ends once this
            // listener is dropped.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
