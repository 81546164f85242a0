//! Service registry: which services live on this node and which on peers.
//!
//! Local entries come from the hosted components and are fixed after
//! startup. Remote entries map a service name to the member address that
//! hosts it; they are only ever added (last write wins) as the node learns
//! about peers from the registration response or `NewMember` announcements.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::component::{Component, ComponentSet};
use crate::error::{ClusterError, ClusterResult};
use crate::topology::MemberInfo;

/// Where a service is served from.
#[derive(Clone)]
pub enum Location {
    Local(Arc<dyn Component>),
    Remote(String),
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Remote(addr) => f.debug_tuple("Remote").field(addr).finish(),
        }
    }
}

/// Split `"Service.method"` into its two halves.
pub fn split_route(route: &str) -> ClusterResult<(&str, &str)> {
    match route.split_once('.') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => Ok((service, method)),
        _ => Err(ClusterError::Routing(format!("invalid route {route:?}"))),
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}

/// Maps service names to local components or remote member addresses.
pub struct ServiceRegistry {
    local: BTreeMap<String, Arc<dyn Component>>,
    remote: RwLock<HashMap<String, String>>,
}

impl ServiceRegistry {
    /// Build the local half of the registry from the hosted components.
    ///
    /// Fails on the first component with an invalid or duplicate service
    /// name, or with no usable handler methods.
    pub fn build(components: &ComponentSet) -> ClusterResult<Self> {
        let mut local: BTreeMap<String, Arc<dyn Component>> = BTreeMap::new();

        for entry in components.list() {
            let name = entry.service_name();
            if !valid_name(&name) {
                return Err(ClusterError::Component(format!("invalid service name {name:?}")));
            }
            if local.contains_key(&name) {
                return Err(ClusterError::Component(format!("service {name} already registered")));
            }

            let methods = entry.component.methods();
            if methods.is_empty() {
                return Err(ClusterError::Component(format!(
                    "service {name} has no handler methods"
                )));
            }
            if let Some(bad) = methods.iter().find(|m| !valid_name(m)) {
                return Err(ClusterError::Component(format!(
                    "service {name} has invalid method name {bad:?}"
                )));
            }

            debug!(service = %name, methods = methods.len(), "registered local service");
            local.insert(name, Arc::clone(&entry.component));
        }

        Ok(Self {
            local,
            remote: RwLock::new(HashMap::new()),
        })
    }

    /// Names of the services hosted on this node, sorted.
    pub fn local_services(&self) -> Vec<String> {
        self.local.keys().cloned().collect()
    }

    pub fn local_component(&self, service: &str) -> Option<Arc<dyn Component>> {
        self.local.get(service).cloned()
    }

    /// Resolve a service. Local services shadow remote entries.
    pub fn lookup(&self, service: &str) -> Option<Location> {
        if let Some(component) = self.local.get(service) {
            return Some(Location::Local(Arc::clone(component)));
        }
        let remote = self.remote.read().expect("registry lock");
        remote.get(service).cloned().map(Location::Remote)
    }

    /// Record every service of `member` as hosted at its address.
    pub fn add_remote(&self, member: &MemberInfo) {
        let mut remote = self.remote.write().expect("registry lock");
        for service in &member.services {
            remote.insert(service.clone(), member.member_addr.clone());
        }
        debug!(
            member_addr = %member.member_addr,
            services = member.services.len(),
            "remote services added"
        );
    }

    /// Seed remote entries from a registration response, skipping this
    /// node's own entry.
    pub fn init_remote(&self, members: &[MemberInfo], self_addr: &str) {
        for member in members.iter().filter(|m| m.member_addr != self_addr) {
            self.add_remote(member);
        }
    }

    /// Snapshot of the remote service map.
    pub fn remote_services(&self) -> HashMap<String, String> {
        self.remote.read().expect("registry lock").clone()
    }

    /// Build the route index over the local handlers.
    pub fn route_index(&self) -> RouteIndex {
        let routes = self.local.iter().flat_map(|(service, component)| {
            component
                .methods()
                .into_iter()
                .map(move |method| format!("{service}.{method}"))
        });
        RouteIndex::new(routes)
    }
}

/// Immutable index of local handler routes, built once per startup.
///
/// Each route gets a stable numeric code (sorted order, starting at 1)
/// that clients may use instead of the route string.
#[derive(Debug, Clone, Default)]
pub struct RouteIndex {
    codes: BTreeMap<String, u16>,
    routes: HashMap<u16, String>,
}

impl RouteIndex {
    pub fn new(routes: impl IntoIterator<Item = String>) -> Self {
        let mut sorted: Vec<String> = routes.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        let codes: BTreeMap<String, u16> = sorted
            .into_iter()
            .zip(1u16..)
            .collect();
        let routes = codes.iter().map(|(r, c)| (*c, r.clone())).collect();

        Self { codes, routes }
    }

    pub fn contains(&self, route: &str) -> bool {
        self.codes.contains_key(route)
    }

    pub fn code(&self, route: &str) -> Option<u16> {
        self.codes.get(route).copied()
    }

    pub fn route(&self, code: u16) -> Option<&str> {
        self.routes.get(&code).map(String::as_str)
    }

    /// Route → code dictionary, as sent to clients in the handshake.
    pub fn dictionary(&self) -> &BTreeMap<String, u16> {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::component::{HandlerFuture, RegistrationOptions};
    use crate::router::HandlerContext;
    use crate::topology::MemberType;

    struct Stub {
        name: &'static str,
        methods: Vec<&'static str>,
    }

    impl Component for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn methods(&self) -> Vec<String> {
            self.methods.iter().map(|m| m.to_string()).collect()
        }

        fn handle<'a>(
            &'a self,
            _ctx: &'a HandlerContext,
            _method: &'a str,
            payload: Bytes,
        ) -> HandlerFuture<'a> {
            Box::pin(async move { Ok(Some(payload)) })
        }
    }

    fn stub(name: &'static str, methods: &[&'static str]) -> Arc<dyn Component> {
        Arc::new(Stub {
            name,
            methods: methods.to_vec(),
        })
    }

    fn member(addr: &str, services: &[&str]) -> MemberInfo {
        MemberInfo {
            member_type: MemberType::Member,
            member_addr: addr.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn builds_local_services() {
        let mut set = ComponentSet::new();
        set.register(stub("room", &["join"])).register(stub("chat", &["send"]));

        let registry = ServiceRegistry::build(&set).unwrap();
        assert_eq!(registry.local_services(), vec!["chat", "room"]);
        assert!(matches!(registry.lookup("room"), Some(Location::Local(_))));
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn rejects_bad_components() {
        let mut dup = ComponentSet::new();
        dup.register(stub("room", &["join"])).register(stub("room", &["leave"]));
        assert!(matches!(ServiceRegistry::build(&dup), Err(ClusterError::Component(_))));

        let mut empty = ComponentSet::new();
        empty.register(stub("room", &[]));
        assert!(ServiceRegistry::build(&empty).is_err());

        let mut dotted = ComponentSet::new();
        dotted.register_with(stub("room", &["join"]), RegistrationOptions::with_name("a.b"));
        assert!(ServiceRegistry::build(&dotted).is_err());
    }

    #[test]
    fn remote_entries_are_additive_and_idempotent() {
        let registry = ServiceRegistry::build(&ComponentSet::new()).unwrap();

        let peer = member("10.0.0.2:9001", &["chat", "room"]);
        registry.add_remote(&peer);
        registry.add_remote(&peer);

        let remote = registry.remote_services();
        assert_eq!(remote.len(), 2);
        assert_eq!(remote["chat"], "10.0.0.2:9001");
        assert!(matches!(registry.lookup("chat"), Some(Location::Remote(a)) if a == "10.0.0.2:9001"));
    }

    #[test]
    fn init_remote_skips_self_and_local_shadows_remote() {
        let mut set = ComponentSet::new();
        set.register(stub("gate", &["login"]));
        let registry = ServiceRegistry::build(&set).unwrap();

        registry.init_remote(
            &[
                member("10.0.0.1:9001", &["gate", "auth"]),
                member("10.0.0.9:9001", &["self-only"]),
            ],
            "10.0.0.9:9001",
        );

        assert!(registry.remote_services().get("self-only").is_none());
        assert!(matches!(registry.lookup("auth"), Some(Location::Remote(_))));
        assert!(matches!(registry.lookup("gate"), Some(Location::Local(_))));
    }

    #[test]
    fn route_index_assigns_sorted_codes() {
        let mut set = ComponentSet::new();
        set.register(stub("room", &["leave", "join"])).register(stub("chat", &["send"]));
        let registry = ServiceRegistry::build(&set).unwrap();

        let index = registry.route_index();
        assert_eq!(index.len(), 3);
        assert_eq!(index.code("chat.send"), Some(1));
        assert_eq!(index.code("room.join"), Some(2));
        assert_eq!(index.route(3), Some("room.leave"));
        assert!(!index.contains("room.kick"));
    }

    #[test]
    fn split_route_validates() {
        assert_eq!(split_route("room.join").unwrap(), ("room", "join"));
        assert!(split_route("room").is_err());
        assert!(split_route(".join").is_err());
        assert!(split_route("room.").is_err());
    }
}
