//! Member-side gRPC server: inbound routing from peers.
//!
//! Every clustered node serves `MemberService`. Requests and notifies are
//! dispatched to local handlers only; pushes and responses are delivered
//! to local client sessions. Handler failures travel back inside the
//! `MemberHandleResponse` envelope rather than as gRPC statuses.

use std::sync::Arc;

use bytes::Bytes;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::proto;
use crate::proto::member_service_server::{MemberService, MemberServiceServer};
use crate::router::{Origin, Router};
use crate::topology::MemberInfo;

/// gRPC implementation of the member service.
pub struct MemberInbound {
    router: Arc<Router>,
}

impl MemberInbound {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> MemberServiceServer<Self> {
        MemberServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl MemberService for MemberInbound {
    async fn handle_request(
        &self,
        request: Request<proto::RequestMessage>,
    ) -> Result<Response<proto::MemberHandleResponse>, Status> {
        let req = request.into_inner();
        let origin = Origin {
            gate_addr: req.gate_addr,
            session_id: req.session_id,
        };
        debug!(route = %req.route, gate = %origin.gate_addr, "inbound request");

        let reply = match self
            .router
            .dispatch_local(&origin, req.id, &req.route, Bytes::from(req.data))
            .await
        {
            Ok(Some(data)) => proto::MemberHandleResponse::ok(data.to_vec()),
            Ok(None) => proto::MemberHandleResponse::deferred(),
            Err(e) => {
                warn!(route = %req.route, error = %e, "inbound request failed");
                proto::MemberHandleResponse::failed(e)
            }
        };
        Ok(Response::new(reply))
    }

    async fn handle_notify(
        &self,
        request: Request<proto::NotifyMessage>,
    ) -> Result<Response<proto::MemberHandleResponse>, Status> {
        let req = request.into_inner();
        let origin = Origin {
            gate_addr: req.gate_addr,
            session_id: req.session_id,
        };

        let reply = match self
            .router
            .dispatch_local(&origin, 0, &req.route, Bytes::from(req.data))
            .await
        {
            Ok(_) => proto::MemberHandleResponse::ok(Vec::new()),
            Err(e) => {
                warn!(route = %req.route, error = %e, "inbound notify failed");
                proto::MemberHandleResponse::failed(e)
            }
        };
        Ok(Response::new(reply))
    }

    async fn handle_push(
        &self,
        request: Request<proto::PushMessage>,
    ) -> Result<Response<proto::MemberHandleResponse>, Status> {
        let req = request.into_inner();
        let reply = match self
            .router
            .sessions()
            .push(req.session_id, &req.route, Bytes::from(req.data))
        {
            Ok(()) => proto::MemberHandleResponse::ok(Vec::new()),
            Err(e) => proto::MemberHandleResponse::failed(e),
        };
        Ok(Response::new(reply))
    }

    async fn handle_response(
        &self,
        request: Request<proto::ResponseMessage>,
    ) -> Result<Response<proto::MemberHandleResponse>, Status> {
        let req = request.into_inner();
        let reply = match self
            .router
            .sessions()
            .respond(req.session_id, req.id, Bytes::from(req.data))
        {
            Ok(()) => proto::MemberHandleResponse::ok(Vec::new()),
            Err(e) => proto::MemberHandleResponse::failed(e),
        };
        Ok(Response::new(reply))
    }

    async fn new_member(
        &self,
        request: Request<proto::NewMemberRequest>,
    ) -> Result<Response<proto::NewMemberResponse>, Status> {
        let info = request
            .into_inner()
            .member_info
            .ok_or_else(|| Status::invalid_argument("member_info is required"))?;
        let info = MemberInfo::try_from(info).map_err(|e| Status::invalid_argument(e.to_string()))?;

        if info.member_addr != self.router.member_addr() {
            self.router.registry().add_remote(&info);
        }
        info!(member_addr = %info.member_addr, services = ?info.services, "learned about new member");

        Ok(Response::new(proto::NewMemberResponse {}))
    }
}
