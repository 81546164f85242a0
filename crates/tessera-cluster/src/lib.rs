//! tessera-cluster — node lifecycle and cluster membership for Tessera.
//!
//! A node hosts application components, announces their services to the
//! cluster, learns the services hosted by peers, and routes calls between
//! them. Clients connect over raw TCP or WebSocket (optionally TLS).
//!
//! # Architecture
//!
//! ```text
//! Master
//!   ├── ClusterServer (gRPC MasterService)
//!   │   └── Register() → appends to ClusterTopology, returns all members,
//!   │                    announces the newcomer to earlier members
//!   └── MemberInbound (gRPC MemberService)
//!
//! Member
//!   ├── MemberInbound (gRPC MemberService)
//!   │   ├── HandleRequest/HandleNotify → local components
//!   │   ├── HandlePush/HandleResponse  → local client sessions
//!   │   └── NewMember                  → ServiceRegistry remote entries
//!   └── registers with the master during startup
//!
//! Every node
//!   ├── ServiceRegistry + RouteIndex
//!   ├── RpcClient (per-address channel pools)
//!   ├── Router (local or remote dispatch)
//!   └── Acceptor (tcp | ws | wss) → ConnectionHandler
//! ```

pub mod acceptor;
pub mod codec;
pub mod component;
pub mod config;
pub mod error;
pub mod handler;
pub mod inbound;
pub mod node;
pub mod proto;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod server;
pub mod session;
pub mod tls;
pub mod topology;

pub use component::{Component, ComponentSet, HandlerFuture, RegistrationOptions};
pub use config::{NodeConfig, Role, TransportKind};
pub use error::{ClusterError, ClusterResult};
pub use handler::{Connection, ConnectionHandler, LocalHandler};
pub use inbound::MemberInbound;
pub use node::{Node, NodeState};
pub use registry::{RouteIndex, ServiceRegistry};
pub use router::{HandlerContext, Origin, Router};
pub use rpc::{ConnArray, Dialer, GrpcDialer, RpcClient};
pub use server::ClusterServer;
pub use topology::{ClusterTopology, Member, MemberInfo, MemberType};
