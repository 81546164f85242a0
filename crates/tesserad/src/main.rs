//! tesserad — the Tessera node daemon.
//!
//! Runs one cluster node hosting the demo `echo` component. The role
//! follows the flags: `--master` forms a cluster, `--advertise` without
//! `--master` joins one, neither runs standalone.
//!
//! # Usage
//!
//! ```text
//! tesserad --master --advertise 127.0.0.1:34567 --member-addr 127.0.0.1:34568
//! tesserad --advertise 127.0.0.1:34567 --member-addr 127.0.0.1:34569 --server-addr 0.0.0.0:3251
//! ```

mod echo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tessera_cluster::{ComponentSet, Node, NodeConfig, TransportKind};
use tracing::info;

use crate::echo::EchoComponent;

#[derive(Parser, Debug)]
#[command(name = "tesserad", about = "Tessera cluster node daemon")]
struct Cli {
    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run as the cluster master.
    #[arg(long)]
    master: bool,

    /// Master address: listen address on the master, registration target on members.
    #[arg(long)]
    advertise: Option<String>,

    /// This node's inbound RPC address (host:port).
    #[arg(long)]
    member_addr: Option<String>,

    /// Client-facing listen address.
    #[arg(long)]
    server_addr: Option<String>,

    /// Client transport: tcp, ws or wss.
    #[arg(long)]
    transport: Option<TransportKind>,

    /// PEM certificate chain for wss.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for wss.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// WebSocket upgrade path.
    #[arg(long)]
    ws_path: Option<String>,

    /// Allowed WebSocket origin; repeatable. None means any origin.
    #[arg(long = "allow-origin")]
    allowed_origins: Vec<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if self.master {
            config.is_master = true;
        }
        if let Some(addr) = self.advertise {
            config.advertise_addr = Some(addr);
        }
        if let Some(addr) = self.member_addr {
            config.member_addr = Some(addr);
        }
        if let Some(addr) = self.server_addr {
            config.server_addr = addr;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if self.tls_cert.is_some() {
            config.tls_cert = self.tls_cert;
        }
        if self.tls_key.is_some() {
            config.tls_key = self.tls_key;
        }
        if let Some(path) = self.ws_path {
            config.ws_path = path;
        }
        if !self.allowed_origins.is_empty() {
            config.allowed_origins = self.allowed_origins;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tesserad=debug,tessera_cluster=debug".into()),
        )
        .init();

    let config = Cli::parse().into_config()?;
    info!(role = ?config.role(), transport = ?config.transport, "tessera daemon starting");

    let mut components = ComponentSet::new();
    components.register(Arc::new(EchoComponent));

    let mut node = Node::new(config, components);
    node.startup().await.context("node startup failed")?;
    if let Some(addr) = node.server_addr() {
        info!(%addr, "accepting clients");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    node.shutdown().await?;
    info!("tessera daemon stopped");
    Ok(())
}
