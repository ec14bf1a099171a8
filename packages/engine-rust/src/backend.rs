use connscope_core::ConnectionDefinition;

use crate::status::ConnectionStatus;

/// Backend-specific connection lifecycle hooks driven by the engine.
/// Implementations: in-memory (tests, demos); drivers live outside this crate.
///
/// Errors are returned as `anyhow::Error` and reach the caller unchanged,
/// wrapped in `ConnectionError::Backend`.
pub trait ConnectionBackend: Send + Sync + 'static {
    /// Raw connection handle. Cloned to share one connection between the
    /// statuses of nested scopes, so it is usually a cheap handle (`Arc`, id).
    type Connection: Clone + Send + Sync + 'static;

    /// Acquire a new raw connection for `definition`.
    fn open_connection(&self, definition: &ConnectionDefinition) -> anyhow::Result<Self::Connection>;

    /// Prepare a connection for a scope (isolation, read-only flag, ...).
    /// Called for newly opened and for reused connections.
    fn setup_connection(&self, status: &ConnectionStatus<Self::Connection>) -> anyhow::Result<()>;

    /// Release a connection. Only called for statuses with `is_new() == true`.
    fn close_connection(&self, status: &ConnectionStatus<Self::Connection>) -> anyhow::Result<()>;
}
