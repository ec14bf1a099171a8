//! In-memory [`ConnectionBackend`] implementation.
//!
//! [`MemoryBackend`] hands out numbered [`MemoryConnection`] handles and
//! tracks which of them are open in a [`DashMap`]. Useful for testing,
//! demos, and as a template for real backends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use connscope_core::{ConnectionDefinition, Isolation};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::backend::ConnectionBackend;
use crate::status::ConnectionStatus;

/// Attributes applied to a connection by `setup_connection`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub isolation: Isolation,
    pub read_only: bool,
    pub timeout: Option<Duration>,
    /// Number of scopes that have set this connection up so far.
    pub setups: u32,
}

#[derive(Debug)]
struct MemoryConnectionState {
    id: u64,
    name: Option<String>,
    closed: AtomicBool,
    settings: Mutex<ConnectionSettings>,
}

/// Cheap, cloneable handle to an in-memory connection. Clones share state,
/// and equality is identity.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    state: Arc<MemoryConnectionState>,
}

impl MemoryConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Name of the definition the connection was opened for.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.state.name.as_deref()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn settings(&self) -> ConnectionSettings {
        self.state.settings.lock().clone()
    }
}

impl PartialEq for MemoryConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for MemoryConnection {}

/// In-memory backend tracking open connections.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    next_id: AtomicU64,
    open: DashMap<u64, MemoryConnection>,
    closed_total: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Number of connections ever opened.
    #[must_use]
    pub fn opened_total(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Number of connections ever closed.
    #[must_use]
    pub fn closed_total(&self) -> u64 {
        self.closed_total.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_open(&self, id: u64) -> bool {
        self.open.contains_key(&id)
    }
}

impl ConnectionBackend for MemoryBackend {
    type Connection = MemoryConnection;

    fn open_connection(&self, definition: &ConnectionDefinition) -> anyhow::Result<MemoryConnection> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = MemoryConnection {
            state: Arc::new(MemoryConnectionState {
                id,
                name: definition.name().map(str::to_string),
                closed: AtomicBool::new(false),
                settings: Mutex::new(ConnectionSettings::default()),
            }),
        };
        self.open.insert(id, connection.clone());
        tracing::trace!(connection = id, "memory connection opened");
        Ok(connection)
    }

    fn setup_connection(&self, status: &ConnectionStatus<MemoryConnection>) -> anyhow::Result<()> {
        let connection = status.connection();
        if connection.is_closed() {
            bail!("memory connection {} is closed", connection.id());
        }
        let definition = status.definition();
        let mut settings = connection.state.settings.lock();
        if let Some(isolation) = definition.isolation() {
            settings.isolation = isolation;
        }
        if let Some(read_only) = definition.is_read_only() {
            settings.read_only = read_only;
        }
        if let Some(timeout) = definition.timeout() {
            settings.timeout = Some(timeout);
        }
        settings.setups = settings.setups.saturating_add(1);
        Ok(())
    }

    fn close_connection(&self, status: &ConnectionStatus<MemoryConnection>) -> anyhow::Result<()> {
        let connection = status.connection();
        if self.open.remove(&connection.id()).is_none() {
            bail!("memory connection {} is not open", connection.id());
        }
        connection.state.closed.store(true, Ordering::Release);
        self.closed_total.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(connection = connection.id(), "memory connection closed");
        Ok(())
    }
}
