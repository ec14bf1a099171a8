//! Connection status: the per-scope record the engine hands to units of work.
//!
//! A [`ConnectionStatus`] wraps the raw connection handle together with the
//! definition it was opened for, whether this scope owns the connection
//! (`is_new`), its completion state, and the ordered list of
//! [`ConnectionSynchronization`] callbacks fired when the scope completes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use connscope_core::{ConnectionDefinition, ConnectionError, Result};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// ConnectionSynchronization
// ---------------------------------------------------------------------------

/// Callback fired at defined points of a scope's completion sequence.
///
/// Hooks run in registration order. A failing hook does not stop the
/// remaining hooks or the connection close; its error is reported by
/// `complete`.
pub trait ConnectionSynchronization: Send + Sync {
    /// The unit of work has finished.
    fn execution_complete(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs right before the connection is closed (or would be, for a
    /// borrowed connection).
    fn before_closed(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the connection is closed.
    fn after_closed(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Points of the completion sequence at which synchronizations fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizationStage {
    ExecutionComplete,
    BeforeClosed,
    AfterClosed,
}

impl SynchronizationStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionComplete => "execution_complete",
            Self::BeforeClosed => "before_closed",
            Self::AfterClosed => "after_closed",
        }
    }
}

impl fmt::Display for SynchronizationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConnectionStatus
// ---------------------------------------------------------------------------

/// One active or pending connection scope.
///
/// Nested scopes that reuse a connection get their own status sharing the
/// same handle, so each nesting level tracks its own completion and
/// synchronizations.
pub struct ConnectionStatus<C> {
    connection: C,
    definition: ConnectionDefinition,
    is_new: bool,
    completed: AtomicBool,
    synchronizations: Mutex<Vec<Arc<dyn ConnectionSynchronization>>>,
}

impl<C> ConnectionStatus<C> {
    pub(crate) fn new(connection: C, definition: ConnectionDefinition, is_new: bool) -> Self {
        Self {
            connection,
            definition,
            is_new,
            completed: AtomicBool::new(false),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    /// The raw connection handle, shared with the unit of work for the
    /// duration of the scope.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn definition(&self) -> &ConnectionDefinition {
        &self.definition
    }

    /// `true` when this scope opened the connection and closes it on
    /// completion; `false` when the connection is borrowed from an outer scope.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Registers a callback for this scope's completion sequence.
    ///
    /// Returns `false` when the status is already completed: the callback
    /// never fires and is dropped.
    pub fn register_synchronization(&self, synchronization: impl ConnectionSynchronization + 'static) -> bool {
        self.register_shared(Arc::new(synchronization))
    }

    pub(crate) fn register_shared(&self, synchronization: Arc<dyn ConnectionSynchronization>) -> bool {
        let mut synchronizations = self.synchronizations.lock();
        if self.is_completed() {
            tracing::warn!("synchronization registered on a completed connection status; ignoring");
            return false;
        }
        synchronizations.push(synchronization);
        true
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    /// Flips the status to completed and hands back the registered
    /// synchronizations, which also releases anything they hold. Fails when
    /// the status already was completed.
    ///
    /// Runs under the synchronization lock, so a concurrent registration
    /// either lands in the returned list or is rejected.
    pub(crate) fn mark_completed(&self) -> Result<Vec<Arc<dyn ConnectionSynchronization>>> {
        let mut synchronizations = self.synchronizations.lock();
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConnectionError::AlreadyCompleted)?;
        Ok(std::mem::take(&mut *synchronizations))
    }
}

impl<C: fmt::Debug> fmt::Debug for ConnectionStatus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStatus")
            .field("connection", &self.connection)
            .field("definition", &self.definition)
            .field("is_new", &self.is_new)
            .field("completed", &self.is_completed())
            .field("synchronizations", &self.synchronization_count())
            .finish()
    }
}

/// Runs `stage` on every synchronization in order, collecting failures.
pub(crate) fn fire_stage(
    synchronizations: &[Arc<dyn ConnectionSynchronization>],
    stage: SynchronizationStage,
    errors: &mut Vec<ConnectionError>,
) {
    for synchronization in synchronizations {
        let result = match stage {
            SynchronizationStage::ExecutionComplete => synchronization.execution_complete(),
            SynchronizationStage::BeforeClosed => synchronization.before_closed(),
            SynchronizationStage::AfterClosed => synchronization.after_closed(),
        };
        if let Err(err) = result {
            errors.push(ConnectionError::Backend(err));
        }
    }
}
