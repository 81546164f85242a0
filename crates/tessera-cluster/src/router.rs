//! Transparent routing of client traffic between local components and peers.
//!
//! Requests and notifies are resolved through the [`ServiceRegistry`]:
//! local services run in-process, remote ones are forwarded to the owning
//! member's `MemberService`. Pushes and deferred responses travel back to
//! the node holding the client session (the *gate*).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tonic::transport::Channel;
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::proto;
use crate::proto::member_service_client::MemberServiceClient;
use crate::registry::{Location, RouteIndex, ServiceRegistry, split_route};
use crate::rpc::RpcClient;
use crate::session::{SessionId, SessionRegistry};

/// Where a client message entered the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Member address of the gate node; empty on a standalone node.
    pub gate_addr: String,
    pub session_id: SessionId,
}

/// Per-call context handed to [`crate::Component::handle`].
pub struct HandlerContext {
    router: Arc<Router>,
    origin: Origin,
    request_id: u64,
}

impl HandlerContext {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn session_id(&self) -> SessionId {
        self.origin.session_id
    }

    /// Id of the request being handled; 0 for notifies.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Push a message to the originating client.
    pub async fn push(&self, route: &str, data: Bytes) -> ClusterResult<()> {
        self.router.push(&self.origin, route, data).await
    }

    /// Answer the current request later, after returning `Ok(None)`.
    pub async fn respond(&self, data: Bytes) -> ClusterResult<()> {
        self.router.respond(&self.origin, self.request_id, data).await
    }
}

/// Routes messages between this node's components, its client sessions,
/// and peers.
pub struct Router {
    registry: Arc<ServiceRegistry>,
    index: Arc<RouteIndex>,
    rpc: Arc<RpcClient>,
    sessions: Arc<SessionRegistry>,
    member_addr: String,
    rpc_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        index: Arc<RouteIndex>,
        rpc: Arc<RpcClient>,
        sessions: Arc<SessionRegistry>,
        member_addr: String,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            index,
            rpc,
            sessions,
            member_addr,
            rpc_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<RouteIndex> {
        &self.index
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// This node's member address (empty when standalone).
    pub fn member_addr(&self) -> &str {
        &self.member_addr
    }

    /// Origin for a client session accepted on this node.
    pub fn local_origin(&self, session_id: SessionId) -> Origin {
        Origin {
            gate_addr: self.member_addr.clone(),
            session_id,
        }
    }

    fn is_local_gate(&self, origin: &Origin) -> bool {
        origin.gate_addr.is_empty() || origin.gate_addr == self.member_addr
    }

    /// Route a request, locally or to the member hosting its service.
    pub async fn request(
        self: &Arc<Self>,
        origin: &Origin,
        id: u64,
        route: &str,
        data: Bytes,
    ) -> ClusterResult<Option<Bytes>> {
        let (service, _) = split_route(route)?;
        match self.registry.lookup(service) {
            Some(Location::Local(_)) => self.dispatch_local(origin, id, route, data).await,
            Some(Location::Remote(addr)) => {
                debug!(%route, %addr, "forwarding request");
                let mut client = self.member_client(&addr).await?;
                let reply = self
                    .call(client.handle_request(proto::RequestMessage {
                        gate_addr: origin.gate_addr.clone(),
                        session_id: origin.session_id,
                        id,
                        route: route.to_string(),
                        data: data.to_vec(),
                    }))
                    .await?;
                if !reply.is_ok() {
                    return Err(ClusterError::Routing(reply.error));
                }
                if reply.deferred {
                    return Ok(None);
                }
                Ok(Some(Bytes::from(reply.data)))
            }
            None => Err(ClusterError::Routing(format!("service {service} not found"))),
        }
    }

    /// Route a notify; no response is produced.
    pub async fn notify(self: &Arc<Self>, origin: &Origin, route: &str, data: Bytes) -> ClusterResult<()> {
        let (service, _) = split_route(route)?;
        match self.registry.lookup(service) {
            Some(Location::Local(_)) => self.dispatch_local(origin, 0, route, data).await.map(|_| ()),
            Some(Location::Remote(addr)) => {
                debug!(%route, %addr, "forwarding notify");
                let mut client = self.member_client(&addr).await?;
                let reply = self
                    .call(client.handle_notify(proto::NotifyMessage {
                        gate_addr: origin.gate_addr.clone(),
                        session_id: origin.session_id,
                        route: route.to_string(),
                        data: data.to_vec(),
                    }))
                    .await?;
                if !reply.is_ok() {
                    return Err(ClusterError::Routing(reply.error));
                }
                Ok(())
            }
            None => Err(ClusterError::Routing(format!("service {service} not found"))),
        }
    }

    /// Run a handler hosted on this node. Never forwards.
    pub async fn dispatch_local(
        self: &Arc<Self>,
        origin: &Origin,
        id: u64,
        route: &str,
        data: Bytes,
    ) -> ClusterResult<Option<Bytes>> {
        let (service, method) = split_route(route)?;
        let component = self
            .registry
            .local_component(service)
            .ok_or_else(|| ClusterError::Routing(format!("service {service} not hosted on this node")))?;
        if !self.index.contains(route) {
            return Err(ClusterError::Routing(format!("handler {route} not found")));
        }

        let ctx = HandlerContext {
            router: Arc::clone(self),
            origin: origin.clone(),
            request_id: id,
        };
        debug!(%route, session_id = origin.session_id, "dispatching locally");
        component.handle(&ctx, method, data).await
    }

    /// Push to a client session, wherever its gate is.
    pub async fn push(&self, origin: &Origin, route: &str, data: Bytes) -> ClusterResult<()> {
        if self.is_local_gate(origin) {
            return self.sessions.push(origin.session_id, route, data);
        }

        let mut client = self.member_client(&origin.gate_addr).await?;
        let reply = self
            .call(client.handle_push(proto::PushMessage {
                session_id: origin.session_id,
                route: route.to_string(),
                data: data.to_vec(),
            }))
            .await?;
        if !reply.is_ok() {
            return Err(ClusterError::Routing(reply.error));
        }
        Ok(())
    }

    /// Deliver a deferred response to a client session.
    pub async fn respond(&self, origin: &Origin, id: u64, data: Bytes) -> ClusterResult<()> {
        if self.is_local_gate(origin) {
            return self.sessions.respond(origin.session_id, id, data);
        }

        let mut client = self.member_client(&origin.gate_addr).await?;
        let reply = self
            .call(client.handle_response(proto::ResponseMessage {
                session_id: origin.session_id,
                id,
                data: data.to_vec(),
            }))
            .await?;
        if !reply.is_ok() {
            return Err(ClusterError::Routing(reply.error));
        }
        Ok(())
    }

    async fn member_client(&self, addr: &str) -> ClusterResult<MemberServiceClient<Channel>> {
        let conns = self.rpc.get_conn_array(addr).await?;
        Ok(MemberServiceClient::new(conns.get()))
    }

    async fn call<F>(&self, fut: F) -> ClusterResult<proto::MemberHandleResponse>
    where
        F: std::future::Future<Output = Result<tonic::Response<proto::MemberHandleResponse>, tonic::Status>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(ClusterError::Transport(format!("gRPC: {status}"))),
            Err(_) => Err(ClusterError::Transport("inter-node call timed out".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::component::{Component, ComponentSet, HandlerFuture};
    use crate::rpc::GrpcDialer;
    use crate::session::Outbound;
    use crate::topology::{MemberInfo, MemberType};

    /// Echoes requests; `greet` pushes to the caller and answers later.
    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    impl Component for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn methods(&self) -> Vec<String> {
            vec!["say".to_string(), "greet".to_string()]
        }

        fn handle<'a>(
            &'a self,
            ctx: &'a HandlerContext,
            method: &'a str,
            payload: Bytes,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(method.to_string());
                match method {
                    "say" => Ok(Some(payload)),
                    _ => {
                        ctx.push("echo.onGreet", Bytes::from_static(b"hello")).await?;
                        ctx.respond(payload).await?;
                        Ok(None)
                    }
                }
            })
        }
    }

    fn router(member_addr: &str) -> Arc<Router> {
        let mut set = ComponentSet::new();
        set.register(Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        }));
        let registry = Arc::new(ServiceRegistry::build(&set).unwrap());
        let index = Arc::new(registry.route_index());
        let rpc = Arc::new(RpcClient::new(
            Arc::new(GrpcDialer::new(Duration::from_millis(200))),
            1,
        ));
        Arc::new(Router::new(
            registry,
            index,
            rpc,
            Arc::new(SessionRegistry::new()),
            member_addr.to_string(),
            Duration::from_millis(500),
        ))
    }

    #[tokio::test]
    async fn local_request_returns_payload() {
        let router = router("");
        let origin = router.local_origin(1);
        let resp = router
            .request(&origin, 7, "echo.say", Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(resp, Some(Bytes::from_static(b"ping")));
    }

    #[tokio::test]
    async fn deferred_response_and_push_reach_session() {
        let router = router("");
        let (sid, mut rx) = router.sessions().open();
        let origin = router.local_origin(sid);

        let resp = router
            .request(&origin, 9, "echo.greet", Bytes::from_static(b"later"))
            .await
            .unwrap();
        assert!(resp.is_none());

        assert_eq!(
            rx.recv().await.unwrap(),
            Outbound::Push {
                route: "echo.onGreet".to_string(),
                data: Bytes::from_static(b"hello"),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Outbound::Response {
                id: 9,
                data: Bytes::from_static(b"later"),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn unknown_targets_are_routing_errors() {
        let router = router("");
        let origin = router.local_origin(1);

        for route in ["nope.say", "echo.missing", "malformed"] {
            let err = router.request(&origin, 1, route, Bytes::new()).await.unwrap_err();
            assert!(err.is_routing(), "{route}: {err}");
        }
    }

    #[tokio::test]
    async fn dispatch_local_never_forwards() {
        let router = router("127.0.0.1:9101");
        router.registry().add_remote(&MemberInfo {
            member_type: MemberType::Member,
            member_addr: "127.0.0.1:9102".to_string(),
            services: vec!["chat".to_string()],
        });

        let origin = router.local_origin(1);
        let err = router
            .dispatch_local(&origin, 1, "chat.send", Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_routing());
    }

    #[tokio::test]
    async fn unreachable_remote_is_transport_error() {
        let router = router("127.0.0.1:9101");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        router.registry().add_remote(&MemberInfo {
            member_type: MemberType::Member,
            member_addr: dead,
            services: vec!["chat".to_string()],
        });

        let origin = router.local_origin(1);
        let err = router.request(&origin, 1, "chat.send", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
    }
}
