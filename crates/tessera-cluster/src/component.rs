//! Hosted components: application services driven by the node lifecycle.
//!
//! A component exposes a set of handler methods under a service name and
//! receives four lifecycle hooks. The node calls `init` then `after_init`
//! on every component in registration order during startup, and
//! `before_shutdown` then `shutdown` in reverse order during shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::ClusterResult;
use crate::router::HandlerContext;

/// Boxed future returned by [`Component::handle`].
///
/// `Ok(Some(bytes))` is the response; `Ok(None)` means the component
/// answers later through [`HandlerContext::respond`] (or the call was a
/// notify and needs no answer).
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = ClusterResult<Option<Bytes>>> + Send + 'a>>;

/// An application service hosted by a node.
pub trait Component: Send + Sync + 'static {
    /// Default service name, used unless overridden at registration.
    fn name(&self) -> &str;

    /// Handler method names. Routes are `"<service>.<method>"`.
    fn methods(&self) -> Vec<String>;

    /// Handle one request or notify addressed to `method`.
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        method: &'a str,
        payload: Bytes,
    ) -> HandlerFuture<'a>;

    fn init(&self) {}

    fn after_init(&self) {}

    fn before_shutdown(&self) {}

    fn shutdown(&self) {}
}

/// Per-registration overrides.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Service name replacing [`Component::name`].
    pub name: Option<String>,
}

impl RegistrationOptions {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// A registered component together with its options.
#[derive(Clone)]
pub struct ComponentEntry {
    pub component: Arc<dyn Component>,
    pub options: RegistrationOptions,
}

impl ComponentEntry {
    /// Effective service name.
    pub fn service_name(&self) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| self.component.name().to_string())
    }
}

/// Ordered set of components hosted by a node.
#[derive(Clone, Default)]
pub struct ComponentSet {
    entries: Vec<ComponentEntry>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its own name.
    pub fn register(&mut self, component: Arc<dyn Component>) -> &mut Self {
        self.register_with(component, RegistrationOptions::default())
    }

    /// Register a component with explicit options.
    pub fn register_with(
        &mut self,
        component: Arc<dyn Component>,
        options: RegistrationOptions,
    ) -> &mut Self {
        self.entries.push(ComponentEntry { component, options });
        self
    }

    /// Components in registration order.
    pub fn list(&self) -> &[ComponentEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
