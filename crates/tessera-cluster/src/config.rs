//! Node configuration: role selection, listen addresses, and transport.
//!
//! A node is a **master** when `is_master` is set, a **member** when it
//! is not master but has an `advertise_addr` (the master's address), and
//! **standalone** otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Cluster role derived from the configuration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Member,
    Standalone,
}

/// Client-facing transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw TCP byte stream.
    #[default]
    Tcp,
    /// WebSocket upgrade over plain HTTP.
    Ws,
    /// WebSocket upgrade over HTTPS.
    Wss,
}

impl std::str::FromStr for TransportKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            other => Err(ClusterError::Config(format!(
                "unknown transport {other:?} (expected tcp, ws or wss)"
            ))),
        }
    }
}

/// Configuration consumed by [`crate::Node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Run as the cluster master.
    pub is_master: bool,
    /// Master address: the address the master listens on, or the address
    /// a member registers with.
    pub advertise_addr: Option<String>,
    /// This node's own inbound RPC address (`host:port`).
    pub member_addr: Option<String>,
    /// Client-facing listen address.
    pub server_addr: String,
    pub transport: TransportKind,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// HTTP path serving WebSocket upgrades.
    pub ws_path: String,
    /// Accepted `Origin` header values. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Connections opened per peer address.
    pub rpc_pool_size: usize,
    /// Bound on dials and inter-node calls, in milliseconds.
    pub rpc_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            is_master: false,
            advertise_addr: None,
            member_addr: None,
            server_addr: "0.0.0.0:3250".to_string(),
            transport: TransportKind::Tcp,
            tls_cert: None,
            tls_key: None,
            ws_path: "/".to_string(),
            allowed_origins: Vec::new(),
            rpc_pool_size: 10,
            rpc_timeout_ms: 5_000,
        }
    }
}

impl NodeConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> ClusterResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> ClusterResult<Self> {
        toml::from_str(content).map_err(|e| ClusterError::Config(e.to_string()))
    }

    /// Master configuration: listens for registrations on `advertise_addr`.
    pub fn master(advertise_addr: &str, member_addr: &str, server_addr: &str) -> Self {
        Self {
            is_master: true,
            advertise_addr: Some(advertise_addr.to_string()),
            member_addr: Some(member_addr.to_string()),
            server_addr: server_addr.to_string(),
            ..Self::default()
        }
    }

    /// Member configuration: registers with the master at `master_addr`.
    pub fn member(master_addr: &str, member_addr: &str, server_addr: &str) -> Self {
        Self {
            advertise_addr: Some(master_addr.to_string()),
            member_addr: Some(member_addr.to_string()),
            server_addr: server_addr.to_string(),
            ..Self::default()
        }
    }

    /// Standalone configuration: no cluster wiring.
    pub fn standalone(server_addr: &str) -> Self {
        Self {
            server_addr: server_addr.to_string(),
            ..Self::default()
        }
    }

    pub fn role(&self) -> Role {
        if self.is_master {
            Role::Master
        } else if self.advertise_addr.as_deref().is_some_and(|a| !a.is_empty()) {
            Role::Member
        } else {
            Role::Standalone
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or_default()
    }

    pub fn member_addr(&self) -> &str {
        self.member_addr.as_deref().unwrap_or_default()
    }

    /// The WebSocket path with exactly one leading slash.
    pub fn normalized_ws_path(&self) -> String {
        format!("/{}", self.ws_path.trim_start_matches('/'))
    }

    /// Check the invariants that must hold before any listener opens.
    pub fn validate(&self) -> ClusterResult<()> {
        let role = self.role();

        if role == Role::Master && self.advertise_addr().is_empty() {
            return Err(ClusterError::Config(
                "advertise address cannot be empty in master node".to_string(),
            ));
        }

        if role != Role::Standalone {
            validate_member_addr(self.member_addr())?;
        }

        if self.transport == TransportKind::Wss && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(ClusterError::Config(
                "wss transport requires both tls_cert and tls_key".to_string(),
            ));
        }

        if self.rpc_pool_size == 0 {
            return Err(ClusterError::Config("rpc_pool_size must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// A member address must be `host:port` with a non-empty host and a
/// numeric port.
pub fn validate_member_addr(addr: &str) -> ClusterResult<()> {
    let invalid = || ClusterError::Config(format!("member address ({addr}) invalid in cluster mode"));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}
