//! Error types for the Tessera cluster core.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by node lifecycle, bootstrap, routing and transport code.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Invalid or missing configuration. Raised before any listener opens.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bind, dial or accept failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The master rejected the registration or could not be reached.
    #[error("registration failed: {0}")]
    Registration(String),

    /// A route or session could not be resolved on this node.
    #[error("routing error: {0}")]
    Routing(String),

    /// A component could not be registered (bad name, no methods, duplicate).
    #[error("invalid component: {0}")]
    Component(String),

    /// An application handler returned an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// Lifecycle method called in the wrong state.
    #[error("invalid node state: {0}")]
    InvalidState(String),
}

impl ClusterError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_routing(&self) -> bool {
        matches!(self, Self::Routing(_))
    }
}
