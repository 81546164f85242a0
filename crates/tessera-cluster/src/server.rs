//! Cluster gRPC server: master side.
//!
//! Implements `MasterService`. Runs only on the master and handles
//! `Register` calls from joining members. After a successful registration
//! every previously known member is told about the newcomer through
//! `MemberService.NewMember`.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::config::validate_member_addr;
use crate::proto;
use crate::proto::master_service_server::{MasterService, MasterServiceServer};
use crate::proto::member_service_client::MemberServiceClient;
use crate::registry::ServiceRegistry;
use crate::rpc::RpcClient;
use crate::topology::{ClusterTopology, MemberInfo, MemberType};

/// gRPC implementation of the master service.
pub struct ClusterServer {
    topology: Arc<ClusterTopology>,
    registry: Arc<ServiceRegistry>,
    rpc: Arc<RpcClient>,
    rpc_timeout: Duration,
}

impl ClusterServer {
    pub fn new(
        topology: Arc<ClusterTopology>,
        registry: Arc<ServiceRegistry>,
        rpc: Arc<RpcClient>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            registry,
            rpc,
            rpc_timeout,
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> MasterServiceServer<Self> {
        MasterServiceServer::new(self)
    }

    fn announce(&self, newcomer: MemberInfo, peers: Vec<MemberInfo>) {
        if peers.is_empty() {
            return;
        }

        let rpc = Arc::clone(&self.rpc);
        let timeout = self.rpc_timeout;
        tokio::spawn(async move {
            let wire = proto::MemberInfo::from(&newcomer);
            for peer in peers {
                let addr = peer.member_addr;
                let call = async {
                    let conns = rpc.get_conn_array(&addr).await.map_err(|e| e.to_string())?;
                    MemberServiceClient::new(conns.get())
                        .new_member(proto::NewMemberRequest {
                            member_info: Some(wire.clone()),
                        })
                        .await
                        .map_err(|status| status.to_string())
                };

                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(_)) => debug!(peer = %addr, new_member = %newcomer.member_addr, "announced new member"),
                    Ok(Err(error)) => {
                        warn!(peer = %addr, new_member = %newcomer.member_addr, %error, "new member announcement failed")
                    }
                    Err(_) => {
                        warn!(peer = %addr, new_member = %newcomer.member_addr, "new member announcement timed out")
                    }
                }
            }
        });
    }
}

#[tonic::async_trait]
impl MasterService for ClusterServer {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let info = request
            .into_inner()
            .member_info
            .ok_or_else(|| Status::invalid_argument("member_info is required"))?;
        let info = MemberInfo::try_from(info).map_err(|e| Status::invalid_argument(e.to_string()))?;
        if info.member_type != MemberType::Member {
            return Err(Status::invalid_argument(format!(
                "only members may register, got {}",
                info.member_type.as_str()
            )));
        }
        validate_member_addr(&info.member_addr).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let registration = self
            .topology
            .register(info.clone())
            .map_err(|e| Status::already_exists(e.to_string()))?;

        self.registry.add_remote(&info);
        info!(
            member_addr = %info.member_addr,
            members = registration.members.len(),
            "member registered via gRPC"
        );

        self.announce(info, registration.peers);

        Ok(Response::new(proto::RegisterResponse {
            members: registration.members.iter().map(proto::MemberInfo::from).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentSet;
    use crate::rpc::GrpcDialer;

    fn server() -> ClusterServer {
        let topology = Arc::new(ClusterTopology::new());
        topology.bootstrap_master(MemberInfo {
            member_type: MemberType::Master,
            member_addr: "127.0.0.1:9400".to_string(),
            services: vec![],
        });
        ClusterServer::new(
            topology,
            Arc::new(ServiceRegistry::build(&ComponentSet::new()).unwrap()),
            Arc::new(RpcClient::new(Arc::new(GrpcDialer::new(Duration::from_millis(100))), 1)),
            Duration::from_millis(100),
        )
    }

    fn register(addr: &str, services: &[&str]) -> Request<proto::RegisterRequest> {
        Request::new(proto::RegisterRequest {
            member_info: Some(proto::MemberInfo {
                member_type: "member".to_string(),
                member_addr: addr.to_string(),
                services: services.iter().map(|s| s.to_string()).collect(),
            }),
        })
    }

    #[tokio::test]
    async fn register_returns_members_and_records_services() {
        let server = server();

        let resp = server
            .register(register("127.0.0.1:9401", &["chat"]))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.members.len(), 2);
        assert_eq!(resp.members[0].member_type, "master");
        assert_eq!(resp.members[1].member_addr, "127.0.0.1:9401");
        assert_eq!(server.registry.remote_services()["chat"], "127.0.0.1:9401");
    }

    #[tokio::test]
    async fn duplicate_registration_is_already_exists() {
        let server = server();
        server.register(register("127.0.0.1:9401", &[])).await.unwrap();

        let status = server.register(register("127.0.0.1:9401", &[])).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
        assert_eq!(server.topology.len(), 2);
    }

    #[tokio::test]
    async fn missing_member_info_is_invalid() {
        let server = server();
        let status = server
            .register(Request::new(proto::RegisterRequest { member_info: None }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn malformed_registrant_is_invalid() {
        let server = server();
        for addr in ["", "noport", ":9000", "host:port"] {
            let status = server.register(register(addr, &["chat"])).await.unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument, "{addr:?}");
        }

        let mut as_master = register("127.0.0.1:9401", &[]);
        as_master.get_mut().member_info.as_mut().unwrap().member_type = "master".to_string();
        let status = server.register(as_master).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        assert_eq!(server.topology.len(), 1);
        assert!(server.registry.remote_services().is_empty());
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_fail_registration() {
        let server = server();
        // Nothing listens on the first member's address, so the announcement
        // for the second one fails in the background.
        server.register(register("127.0.0.1:1", &[])).await.unwrap();
        let resp = server
            .register(register("127.0.0.1:9402", &[]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.members.len(), 3);
    }
}
