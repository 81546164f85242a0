//! Wire messages and generated gRPC stubs for inter-node traffic.
//!
//! The `tessera.cluster` package has two services: `MasterService`
//! (member registration, served only by the master) and `MemberService`
//! (routing and membership announcements, served by every clustered node).

/// Snapshot of one cluster member as exchanged on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberInfo {
    /// `"master"` or `"member"`.
    #[prost(string, tag = "1")]
    pub member_type: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub member_addr: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "3")]
    pub services: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    #[prost(message, optional, tag = "1")]
    pub member_info: ::core::option::Option<MemberInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterResponse {
    /// Full member list at registration time, including the registrant.
    #[prost(message, repeated, tag = "1")]
    pub members: ::prost::alloc::vec::Vec<MemberInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewMemberRequest {
    #[prost(message, optional, tag = "1")]
    pub member_info: ::core::option::Option<MemberInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewMemberResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestMessage {
    /// Member address of the node holding the client session.
    #[prost(string, tag = "1")]
    pub gate_addr: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub session_id: i64,
    #[prost(uint64, tag = "3")]
    pub id: u64,
    #[prost(string, tag = "4")]
    pub route: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "5")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotifyMessage {
    #[prost(string, tag = "1")]
    pub gate_addr: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub session_id: i64,
    #[prost(string, tag = "3")]
    pub route: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushMessage {
    #[prost(int64, tag = "1")]
    pub session_id: i64,
    #[prost(string, tag = "2")]
    pub route: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseMessage {
    #[prost(int64, tag = "1")]
    pub session_id: i64,
    #[prost(uint64, tag = "2")]
    pub id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// Uniform result envelope for the four routing RPCs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberHandleResponse {
    /// Empty on success.
    #[prost(string, tag = "1")]
    pub error: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// The handler will answer later through `HandleResponse`; `data` is
    /// not a reply.
    #[prost(bool, tag = "3")]
    pub deferred: bool,
}

impl MemberHandleResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            error: String::new(),
            data,
            deferred: false,
        }
    }

    pub fn deferred() -> Self {
        Self {
            error: String::new(),
            data: Vec::new(),
            deferred: true,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            error: error.to_string(),
            data: Vec::new(),
            deferred: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

include!(concat!(env!("OUT_DIR"), "/tessera.cluster.MasterService.rs"));
include!(concat!(env!("OUT_DIR"), "/tessera.cluster.MemberService.rs"));
