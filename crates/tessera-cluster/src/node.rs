//! Node orchestrator: startup and shutdown of one cluster participant.
//!
//! `startup` validates the configuration, binds the client-facing listener,
//! builds the service registry and route index, joins or forms the
//! cluster, runs the component hooks and finally starts accepting clients.
//! `shutdown` reverses it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::acceptor::{self, AcceptorHandle};
use crate::component::ComponentSet;
use crate::config::{NodeConfig, Role};
use crate::error::{ClusterError, ClusterResult};
use crate::handler::{ConnectionHandler, LocalHandler};
use crate::inbound::MemberInbound;
use crate::proto;
use crate::proto::master_service_client::MasterServiceClient;
use crate::proto::master_service_server::MasterServiceServer;
use crate::proto::member_service_server::MemberServiceServer;
use crate::registry::ServiceRegistry;
use crate::router::Router;
use crate::rpc::{Dialer, GrpcDialer, RpcClient};
use crate::server::ClusterServer;
use crate::session::SessionRegistry;
use crate::topology::{ClusterTopology, MemberInfo, MemberType};

/// Lifecycle states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unconfigured,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// A gRPC server started during bootstrap.
struct GrpcServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl GrpcServer {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(addr = %self.addr, error = %e, "gRPC server task ended abnormally");
        }
        debug!(addr = %self.addr, "gRPC server stopped");
    }
}

/// Everything built by a successful `startup`.
struct Runtime {
    topology: Arc<ClusterTopology>,
    registry: Arc<ServiceRegistry>,
    rpc: Arc<RpcClient>,
    router: Arc<Router>,
    servers: Vec<GrpcServer>,
    acceptor: Option<AcceptorHandle>,
}

/// One cluster participant: master, member or standalone.
pub struct Node {
    config: NodeConfig,
    components: ComponentSet,
    dialer: Option<Arc<dyn Dialer>>,
    handler: Option<Arc<dyn ConnectionHandler>>,
    state: NodeState,
    runtime: Option<Runtime>,
}

impl Node {
    pub fn new(config: NodeConfig, components: ComponentSet) -> Self {
        Self {
            config,
            components,
            dialer: None,
            handler: None,
            state: NodeState::Unconfigured,
            runtime: None,
        }
    }

    /// Replace the gRPC dialer used for every outbound inter-node call.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Replace the built-in [`LocalHandler`] for client connections.
    pub fn with_connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Address the client-facing acceptor is bound to.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .as_ref()
            .and_then(|rt| rt.acceptor.as_ref())
            .map(AcceptorHandle::local_addr)
    }

    /// Cluster membership. Populated on the master only.
    pub fn topology(&self) -> Option<&Arc<ClusterTopology>> {
        self.runtime.as_ref().map(|rt| &rt.topology)
    }

    pub fn registry(&self) -> Option<&Arc<ServiceRegistry>> {
        self.runtime.as_ref().map(|rt| &rt.registry)
    }

    pub fn rpc_client(&self) -> Option<&Arc<RpcClient>> {
        self.runtime.as_ref().map(|rt| &rt.rpc)
    }

    pub fn router(&self) -> Option<&Arc<Router>> {
        self.runtime.as_ref().map(|rt| &rt.router)
    }

    /// Bring the node up. On error nothing started by this call is left
    /// running and the node returns to `Unconfigured`.
    pub async fn startup(&mut self) -> ClusterResult<()> {
        if self.state != NodeState::Unconfigured {
            return Err(ClusterError::InvalidState(format!(
                "startup called in state {:?}",
                self.state
            )));
        }
        self.state = NodeState::Starting;

        let mut servers = Vec::new();
        match self.bring_up(&mut servers).await {
            Ok(runtime) => {
                self.runtime = Some(runtime);
                self.state = NodeState::Running;
                info!(role = ?self.config.role(), addr = ?self.server_addr(), "node running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "node startup failed");
                for server in servers {
                    server.stop().await;
                }
                self.state = NodeState::Unconfigured;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, servers: &mut Vec<GrpcServer>) -> ClusterResult<Runtime> {
        let config = &self.config;
        config.validate()?;
        let role = config.role();

        let registry = Arc::new(ServiceRegistry::build(&self.components)?);
        let index = Arc::new(registry.route_index());
        debug!(routes = index.len(), "route index built");

        let dialer = self
            .dialer
            .clone()
            .unwrap_or_else(|| Arc::new(GrpcDialer::new(config.rpc_timeout())));
        let rpc = Arc::new(RpcClient::new(dialer, config.rpc_pool_size));
        let sessions = Arc::new(SessionRegistry::new());
        let topology = Arc::new(ClusterTopology::new());

        // Claim the client port before anything becomes visible to the
        // cluster, so a bind failure never leaves a registration behind.
        let client_listener = acceptor::bind(config).await?;

        let member_addr = match role {
            Role::Standalone => String::new(),
            _ => config.member_addr().to_string(),
        };
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&rpc),
            sessions,
            member_addr.clone(),
            config.rpc_timeout(),
        ));

        let self_info = |member_type| MemberInfo {
            member_type,
            member_addr: member_addr.clone(),
            services: registry.local_services(),
        };

        match role {
            Role::Master => {
                let inbound = MemberInbound::new(Arc::clone(&router)).into_service();
                let master = ClusterServer::new(
                    Arc::clone(&topology),
                    Arc::clone(&registry),
                    Arc::clone(&rpc),
                    config.rpc_timeout(),
                )
                .into_service();

                if config.advertise_addr() == member_addr {
                    servers.push(serve_grpc(&member_addr, Some(inbound), Some(master)).await?);
                } else {
                    servers.push(serve_grpc(config.advertise_addr(), None, Some(master)).await?);
                    servers.push(serve_grpc(&member_addr, Some(inbound), None).await?);
                }

                topology.bootstrap_master(self_info(MemberType::Master));
            }
            Role::Member => {
                let inbound = MemberInbound::new(Arc::clone(&router)).into_service();
                servers.push(serve_grpc(&member_addr, Some(inbound), None).await?);

                let members = register(&rpc, config, self_info(MemberType::Member)).await?;
                registry.init_remote(&members, &member_addr);
                info!(
                    master = %config.advertise_addr(),
                    members = members.len(),
                    "joined cluster"
                );
            }
            Role::Standalone => debug!("standalone node, skipping cluster bootstrap"),
        }

        for entry in self.components.list() {
            entry.component.init();
        }
        for entry in self.components.list() {
            entry.component.after_init();
        }
        debug!(components = self.components.len(), "components initialized");

        let handler = self
            .handler
            .clone()
            .unwrap_or_else(|| Arc::new(LocalHandler::new(Arc::clone(&router))));
        let acceptor = client_listener.start(handler)?;

        Ok(Runtime {
            topology,
            registry,
            rpc,
            router,
            servers: std::mem::take(servers),
            acceptor: Some(acceptor),
        })
    }

    /// Tear the node down. Allowed once, from `Running`.
    pub async fn shutdown(&mut self) -> ClusterResult<()> {
        if self.state != NodeState::Running {
            return Err(ClusterError::InvalidState(format!(
                "shutdown called in state {:?}",
                self.state
            )));
        }
        self.state = NodeState::ShuttingDown;
        info!("node shutting down");

        for entry in self.components.list().iter().rev() {
            entry.component.before_shutdown();
        }
        for entry in self.components.list().iter().rev() {
            entry.component.shutdown();
        }

        if let Some(runtime) = self.runtime.as_mut() {
            if let Some(acceptor) = runtime.acceptor.take() {
                acceptor.shutdown().await;
            }
            for server in runtime.servers.drain(..) {
                server.stop().await;
            }
        }

        self.state = NodeState::Stopped;
        info!("node stopped");
        Ok(())
    }
}

/// Bind `addr` now and serve the given services until stopped.
async fn serve_grpc(
    addr: &str,
    member: Option<MemberServiceServer<MemberInbound>>,
    master: Option<MasterServiceServer<ClusterServer>>,
) -> ClusterResult<GrpcServer> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ClusterError::Transport(format!("bind gRPC listener {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| ClusterError::Transport(format!("gRPC listener address: {e}")))?;

    let services = match (member.is_some(), master.is_some()) {
        (true, true) => "member+master",
        (true, false) => "member",
        _ => "master",
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let router = Server::builder()
        .add_optional_service(member)
        .add_optional_service(master);

    let task = tokio::spawn(async move {
        let incoming = TcpListenerStream::new(listener);
        if let Err(e) = router
            .serve_with_incoming_shutdown(incoming, async {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(addr = %local, error = %e, "gRPC server error");
        }
    });

    info!(addr = %local, %services, "gRPC server listening");
    Ok(GrpcServer {
        addr: local,
        shutdown_tx,
        task,
    })
}

/// Register with the master and return the member list it replies with.
async fn register(
    rpc: &RpcClient,
    config: &NodeConfig,
    info: MemberInfo,
) -> ClusterResult<Vec<MemberInfo>> {
    let master_addr = config.advertise_addr();
    let call = async {
        let conns = rpc
            .get_conn_array(master_addr)
            .await
            .map_err(|e| ClusterError::Registration(format!("master {master_addr} unreachable: {e}")))?;
        MasterServiceClient::new(conns.get())
            .register(proto::RegisterRequest {
                member_info: Some(proto::MemberInfo::from(&info)),
            })
            .await
            .map_err(|status| {
                ClusterError::Registration(format!("master rejected registration: {}", status.message()))
            })
    };

    let response = tokio::time::timeout(config.rpc_timeout(), call)
        .await
        .map_err(|_| {
            ClusterError::Registration(format!("registration with {master_addr} timed out"))
        })??
        .into_inner();

    response
        .members
        .into_iter()
        .map(MemberInfo::try_from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::component::{Component, HandlerFuture};
    use crate::router::HandlerContext;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}:{hook}", self.name));
        }
    }

    impl Component for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn methods(&self) -> Vec<String> {
            vec!["noop".to_string()]
        }

        fn handle<'a>(
            &'a self,
            _ctx: &'a HandlerContext,
            _method: &'a str,
            _payload: Bytes,
        ) -> HandlerFuture<'a> {
            Box::pin(async { Ok(None) })
        }

        fn init(&self) {
            self.record("init");
        }

        fn after_init(&self) {
            self.record("after_init");
        }

        fn before_shutdown(&self) {
            self.record("before_shutdown");
        }

        fn shutdown(&self) {
            self.record("shutdown");
        }
    }

    #[tokio::test]
    async fn standalone_lifecycle_runs_hooks_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ComponentSet::new();
        for name in ["a", "b", "c"] {
            set.register(Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
            }));
        }

        let mut node = Node::new(NodeConfig::standalone("127.0.0.1:0"), set);
        node.startup().await.unwrap();
        assert_eq!(node.state(), NodeState::Running);
        assert!(node.server_addr().is_some());
        assert!(node.topology().unwrap().is_empty());

        node.shutdown().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "a:init", "b:init", "c:init",
                "a:after_init", "b:after_init", "c:after_init",
                "c:before_shutdown", "b:before_shutdown", "a:before_shutdown",
                "c:shutdown", "b:shutdown", "a:shutdown",
            ]
        );
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_invalid_state() {
        let mut node = Node::new(NodeConfig::standalone("127.0.0.1:0"), ComponentSet::new());
        assert!(matches!(node.shutdown().await, Err(ClusterError::InvalidState(_))));

        node.startup().await.unwrap();
        assert!(matches!(node.startup().await, Err(ClusterError::InvalidState(_))));

        node.shutdown().await.unwrap();
        assert!(matches!(node.shutdown().await, Err(ClusterError::InvalidState(_))));
    }

    #[tokio::test]
    async fn master_without_advertise_addr_is_config_error() {
        let mut config = NodeConfig::standalone("127.0.0.1:0");
        config.is_master = true;
        config.member_addr = Some("127.0.0.1:9500".to_string());

        let mut node = Node::new(config, ComponentSet::new());
        let err = node.startup().await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(node.state(), NodeState::Unconfigured);
    }

    #[tokio::test]
    async fn failed_client_bind_leaves_cluster_ports_free() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let member_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let member_addr = member_listener.local_addr().unwrap().to_string();
        drop(member_listener);

        let config = NodeConfig::master(
            &member_addr,
            &member_addr,
            &taken.local_addr().unwrap().to_string(),
        );
        let mut node = Node::new(config, ComponentSet::new());

        let err = node.startup().await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
        assert_eq!(node.state(), NodeState::Unconfigured);

        // The client port is claimed first, so no gRPC listener was opened.
        tokio::net::TcpListener::bind(&member_addr).await.unwrap();
    }
}
