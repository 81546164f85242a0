//! Client sessions: addressable outbound queues for connected clients.
//!
//! Each accepted connection opens a session. Pushes and deferred responses
//! are delivered by session id, whether they originate on this node or
//! arrive from a peer through `HandlePush` / `HandleResponse`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};

pub type SessionId = i64;

/// Messages a session may have queued before it is considered stuck.
pub const OUTBOX_CAPACITY: usize = 256;

/// A message queued for delivery to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Response {
        id: u64,
        data: Bytes,
        error: Option<String>,
    },
    Push {
        route: String,
        data: Bytes,
    },
}

/// Registry of live client sessions on this node.
///
/// Outboxes are bounded. A session whose queue is full is dropped from the
/// registry, which closes its outbox and ends the client connection.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicI64,
    capacity: usize,
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<Outbound>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            capacity: capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session and return its id and outbound queue.
    pub fn open(&self) -> (SessionId, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.write().expect("sessions lock").insert(id, tx);
        debug!(session_id = id, "session opened");
        (id, rx)
    }

    pub fn close(&self, id: SessionId) {
        if self.sessions.write().expect("sessions lock").remove(&id).is_some() {
            debug!(session_id = id, "session closed");
        }
    }

    /// Queue a message for a session.
    pub fn send(&self, id: SessionId, message: Outbound) -> ClusterResult<()> {
        let sent = {
            let sessions = self.sessions.read().expect("sessions lock");
            let tx = sessions
                .get(&id)
                .ok_or_else(|| ClusterError::Routing(format!("session {id} not found")))?;
            tx.try_send(message)
        };

        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(ClusterError::Routing(format!("session {id} closed"))),
            Err(TrySendError::Full(_)) => {
                warn!(session_id = id, capacity = self.capacity, "session outbox full, dropping session");
                self.close(id);
                Err(ClusterError::Routing(format!("session {id} outbox full")))
            }
        }
    }

    pub fn push(&self, id: SessionId, route: &str, data: Bytes) -> ClusterResult<()> {
        self.send(
            id,
            Outbound::Push {
                route: route.to_string(),
                data,
            },
        )
    }

    pub fn respond(&self, id: SessionId, request_id: u64, data: Bytes) -> ClusterResult<()> {
        self.send(
            id,
            Outbound::Response {
                id: request_id,
                data,
                error: None,
            },
        )
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().expect("sessions lock").contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("sessions lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
