//! Client connection handling.
//!
//! The acceptor hands every accepted byte stream, TCP or WebSocket alike,
//! to a [`ConnectionHandler`]. [`LocalHandler`] is the default: it speaks
//! the framed packet protocol from [`crate::codec`] and routes through the
//! node's [`Router`].

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{self, Packet, RouteRef};
use crate::error::{ClusterError, ClusterResult};
use crate::router::Router;
use crate::session::{Outbound, SessionId};

/// Bidirectional byte stream handed to a [`ConnectionHandler`].
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type Connection = Box<dyn AsyncStream>;

/// Boxed future returned by [`ConnectionHandler::handle`].
pub type ConnectionFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Owns one accepted client connection until it closes.
pub trait ConnectionHandler: Send + Sync {
    fn handle<'a>(&'a self, conn: Connection, peer: SocketAddr) -> ConnectionFuture<'a>;
}

/// Serves clients against this node's router.
pub struct LocalHandler {
    router: Arc<Router>,
}

impl LocalHandler {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    fn resolve(&self, route: &RouteRef) -> ClusterResult<String> {
        match route {
            RouteRef::Name(name) => Ok(name.clone()),
            RouteRef::Code(code) => self
                .router
                .index()
                .route(*code)
                .map(str::to_string)
                .ok_or_else(|| ClusterError::Routing(format!("unknown route code {code}"))),
        }
    }

    async fn serve(
        &self,
        conn: Connection,
        session_id: SessionId,
        mut outbox: mpsc::Receiver<Outbound>,
    ) -> ClusterResult<()> {
        let (mut reader, mut writer) = tokio::io::split(conn);

        codec::write_packet(
            &mut writer,
            &Packet::Handshake {
                routes: self.router.index().dictionary().clone(),
            },
        )
        .await?;

        let mut writer_task = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                if let Err(e) = codec::write_packet(&mut writer, &Packet::from(message)).await {
                    debug!(session_id, error = %e, "client writer stopped");
                    break;
                }
            }
        });

        let origin = self.router.local_origin(session_id);
        let result = loop {
            let read = tokio::select! {
                read = codec::read_packet(&mut reader) => read,
                // The outbox closed: the session was dropped or the client
                // stopped taking writes.
                _ = &mut writer_task => {
                    break Err(ClusterError::Transport(format!("session {session_id} outbox closed")));
                }
            };
            let packet = match read {
                Ok(Some(packet)) => packet,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match packet {
                Packet::Request { id, route, data } => {
                    let router = Arc::clone(&self.router);
                    let origin = origin.clone();
                    let route = self.resolve(&route);
                    tokio::spawn(async move {
                        let outcome = match route {
                            Ok(route) => router.request(&origin, id, &route, Bytes::from(data)).await,
                            Err(e) => Err(e),
                        };
                        let reply = match outcome {
                            Ok(Some(data)) => Outbound::Response { id, data, error: None },
                            // Deferred: the handler responds through its context.
                            Ok(None) => return,
                            Err(e) => Outbound::Response {
                                id,
                                data: Bytes::new(),
                                error: Some(e.to_string()),
                            },
                        };
                        if let Err(e) = router.sessions().send(origin.session_id, reply) {
                            debug!(session_id = origin.session_id, error = %e, "response dropped");
                        }
                    });
                }
                Packet::Notify { route, data } => {
                    let router = Arc::clone(&self.router);
                    let origin = origin.clone();
                    let route = self.resolve(&route);
                    tokio::spawn(async move {
                        let outcome = match route {
                            Ok(route) => router.notify(&origin, &route, Bytes::from(data)).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = outcome {
                            warn!(session_id = origin.session_id, error = %e, "notify failed");
                        }
                    });
                }
                other => {
                    break Err(ClusterError::Transport(format!(
                        "unexpected client packet {other:?}"
                    )));
                }
            }
        };

        writer_task.abort();
        result
    }
}

impl ConnectionHandler for LocalHandler {
    fn handle<'a>(&'a self, conn: Connection, peer: SocketAddr) -> ConnectionFuture<'a> {
        Box::pin(async move {
            let (session_id, outbox) = self.router.sessions().open();
            debug!(%peer, session_id, "client connected");

            if let Err(e) = self.serve(conn, session_id, outbox).await {
                warn!(%peer, session_id, error = %e, "client connection closed with error");
            }

            self.router.sessions().close(session_id);
            debug!(%peer, session_id, "client disconnected");
        })
    }
}
