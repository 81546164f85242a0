//! Generates the tonic client/server stubs for the inter-node services.
//!
//! Message types are hand-declared prost structs in `src/proto.rs`, so the
//! manual service builder is used and no `protoc` is needed.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let master = Service::builder()
        .name("MasterService")
        .package("tessera.cluster")
        .method(unary("register", "Register", "RegisterRequest", "RegisterResponse"))
        .build();

    let member = Service::builder()
        .name("MemberService")
        .package("tessera.cluster")
        .method(unary(
            "handle_request",
            "HandleRequest",
            "RequestMessage",
            "MemberHandleResponse",
        ))
        .method(unary(
            "handle_notify",
            "HandleNotify",
            "NotifyMessage",
            "MemberHandleResponse",
        ))
        .method(unary(
            "handle_push",
            "HandlePush",
            "PushMessage",
            "MemberHandleResponse",
        ))
        .method(unary(
            "handle_response",
            "HandleResponse",
            "ResponseMessage",
            "MemberHandleResponse",
        ))
        .method(unary(
            "new_member",
            "NewMember",
            "NewMemberRequest",
            "NewMemberResponse",
        ))
        .build();

    Builder::new().compile(&[master, member]);
    println!("cargo:rerun-if-changed=build.rs");
}
