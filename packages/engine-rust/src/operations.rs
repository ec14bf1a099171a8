//! The propagation engine.
//!
//! [`ConnectionOperations`] decides for each unit of work whether to reuse
//! the connection published in the ambient context, open a new one, demand
//! that one already exists, or suspend the current one and open a fresh
//! scope:
//!
//! | propagation    | nothing in scope       | connection in scope            |
//! |----------------|------------------------|--------------------------------|
//! | `REQUIRED`     | open new               | reuse                          |
//! | `MANDATORY`    | `NoConnection` error   | reuse                          |
//! | `REQUIRES_NEW` | open new               | suspend, open new, resume      |
//!
//! Two entry points share that table:
//!
//! - [`execute`](ConnectionOperations::execute) runs a callback inside the
//!   scope and completes it on every exit path, panics included.
//! - [`get_connection`](ConnectionOperations::get_connection) installs the
//!   scope as a side effect and leaves completion to the caller, who must
//!   call [`complete`](ConnectionOperations::complete) exactly once.
//!
//! Completion runs a fixed sequence: mark completed, `execution_complete`
//! and `before_closed` synchronizations, close (new connections only),
//! `after_closed` synchronizations. A failing step never skips the steps
//! after it; the first error is returned and the rest are logged and
//! attached as suppressed errors.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use connscope_core::{ConnectionDefinition, ConnectionError, PropagatedContext, Propagation, Result};
use tracing::{debug, warn};

use crate::backend::ConnectionBackend;
use crate::customizer::{ConnectionCustomizer, CustomizerChain, UnitOfWork};
use crate::status::{fire_stage, ConnectionStatus, ConnectionSynchronization, SynchronizationStage};

static NEXT_OPERATIONS_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one engine instance inside the ambient context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationsId(u64);

impl OperationsId {
    fn next() -> Self {
        Self(NEXT_OPERATIONS_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an engine publishes into the ambient context for an active scope.
struct ConnectionContextElement<C> {
    owner: OperationsId,
    status: Arc<ConnectionStatus<C>>,
}

type Element<C> = Arc<ConnectionContextElement<C>>;

// ---------------------------------------------------------------------------
// ConnectionOperations
// ---------------------------------------------------------------------------

/// Connection propagation engine for one backend.
///
/// Several engines (one per backend) can share an ambient context: each
/// only ever sees the elements it published itself.
pub struct ConnectionOperations<B: ConnectionBackend> {
    id: OperationsId,
    name: String,
    backend: B,
    customizers: CustomizerChain<B::Connection>,
}

impl<B: ConnectionBackend> ConnectionOperations<B> {
    /// Creates an engine. `name` only appears in logs.
    pub fn new(name: impl Into<String>, backend: B) -> Self {
        Self {
            id: OperationsId::next(),
            name: name.into(),
            backend,
            customizers: CustomizerChain::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> OperationsId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Registers a customizer for every subsequent `execute` call.
    pub fn add_connection_customizer(
        &self,
        customizer: impl ConnectionCustomizer<B::Connection> + 'static,
    ) {
        self.customizers.add(Arc::new(customizer));
    }

    #[must_use]
    pub fn customizer_count(&self) -> usize {
        self.customizers.len()
    }

    /// Status of the scope this engine currently publishes, if any.
    #[must_use]
    pub fn find_connection_status(&self) -> Option<Arc<ConnectionStatus<B::Connection>>> {
        self.find_context_element()
            .map(|element| Arc::clone(&element.status))
    }

    fn find_context_element(&self) -> Option<Element<B::Connection>> {
        let owner = self.id;
        PropagatedContext::current()
            .find::<ConnectionContextElement<B::Connection>, _>(|element| element.owner == owner)
    }

    // --- Scoped execution ---

    /// Runs `callback` with a connection chosen by `definition`'s propagation.
    ///
    /// The callback is wrapped by the registered customizers first. The
    /// scope is completed on every exit path; if the callback fails and
    /// completion fails too, the callback's error is returned with the
    /// completion error attached.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NoConnection`] for `MANDATORY` with nothing in scope
    /// - backend errors from opening, setting up or closing the connection
    /// - whatever the callback returns
    pub fn execute<R, F>(&self, definition: &ConnectionDefinition, callback: F) -> Result<R>
    where
        F: FnOnce(&ConnectionStatus<B::Connection>) -> Result<R>,
    {
        let existing = self.find_context_element();
        let customizers = self.customizers.snapshot();

        let mut output = None;
        let work = {
            let output = &mut output;
            let work: UnitOfWork<'_, B::Connection> =
                Box::new(move |status: &ConnectionStatus<B::Connection>| -> Result<()> {
                    *output = Some(callback(status)?);
                    Ok(())
                });
            CustomizerChain::apply(&customizers, work)
        };

        match (definition.propagation(), existing) {
            (Propagation::Required | Propagation::RequiresNew, None) => {
                self.execute_with_new_connection(definition, work)?;
            }
            (Propagation::Required | Propagation::Mandatory, Some(existing)) => {
                self.execute_with_existing_connection(&existing, work)?;
            }
            (Propagation::Mandatory, None) => return Err(ConnectionError::no_connection()),
            (Propagation::RequiresNew, Some(existing)) => {
                self.suspend(&existing, || self.execute_with_new_connection(definition, work))?;
            }
        }

        output.ok_or(ConnectionError::NotExecuted)
    }

    /// [`execute`](Self::execute) with [`ConnectionDefinition::READ_ONLY`].
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_read<R, F>(&self, callback: F) -> Result<R>
    where
        F: FnOnce(&ConnectionStatus<B::Connection>) -> Result<R>,
    {
        self.execute(&ConnectionDefinition::READ_ONLY, callback)
    }

    /// [`execute`](Self::execute) with [`ConnectionDefinition::DEFAULT`].
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_write<R, F>(&self, callback: F) -> Result<R>
    where
        F: FnOnce(&ConnectionStatus<B::Connection>) -> Result<R>,
    {
        self.execute(&ConnectionDefinition::DEFAULT, callback)
    }

    fn execute_with_new_connection(
        &self,
        definition: &ConnectionDefinition,
        work: UnitOfWork<'_, B::Connection>,
    ) -> Result<()> {
        let connection = self.backend.open_connection(definition)?;
        let status = Arc::new(ConnectionStatus::new(connection, definition.clone(), true));
        debug!(
            engine = %self.name,
            propagation = %definition.propagation(),
            "opened new connection"
        );

        let guard = CompletionGuard::new(self, Arc::clone(&status));
        let result = {
            let _scope = PropagatedContext::current()
                .plus(self.element(&status))
                .propagate();
            self.backend
                .setup_connection(&status)
                .map_err(ConnectionError::from)
                .and_then(|()| work(&status))
        };
        guard.finish(result)
    }

    fn execute_with_existing_connection(
        &self,
        existing: &Element<B::Connection>,
        work: UnitOfWork<'_, B::Connection>,
    ) -> Result<()> {
        let status = Arc::new(Self::reused_status(existing));
        debug!(engine = %self.name, "reusing connection in scope");

        let guard = CompletionGuard::new(self, Arc::clone(&status));
        let result = self
            .backend
            .setup_connection(&status)
            .map_err(ConnectionError::from)
            .and_then(|()| {
                let _scope = PropagatedContext::current()
                    .replace(existing, self.element(&status))
                    .propagate();
                work(&status)
            });
        guard.finish(result)
    }

    fn suspend<T>(&self, existing: &Element<B::Connection>, nested: impl FnOnce() -> Result<T>) -> Result<T> {
        debug!(engine = %self.name, "suspending connection in scope");
        let result = {
            let _scope = PropagatedContext::current().minus(existing).propagate();
            nested()
        };
        debug!(engine = %self.name, "resumed suspended connection");
        result
    }

    // --- Caller-completed scopes ---

    /// Opens or reuses a connection like [`execute`](Self::execute) but
    /// returns its status instead of running a callback.
    ///
    /// The ambient context is updated immediately. Undoing that update
    /// (and closing a new connection) happens in
    /// [`complete`](Self::complete), which the caller must invoke exactly
    /// once, on the same thread, after any scopes opened in between have
    /// completed.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NoConnection`] for `MANDATORY` with nothing in scope
    /// - backend errors from opening or setting up the connection
    pub fn get_connection(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<ConnectionStatus<B::Connection>>> {
        match (definition.propagation(), self.find_context_element()) {
            (Propagation::Required | Propagation::RequiresNew, None) => {
                self.open_new_connection_internal(definition)
            }
            (Propagation::Required | Propagation::Mandatory, Some(existing)) => {
                self.reuse_existing_connection_internal(existing)
            }
            (Propagation::Mandatory, None) => Err(ConnectionError::no_connection()),
            (Propagation::RequiresNew, Some(existing)) => {
                self.suspend_open_connection(existing, definition)
            }
        }
    }

    fn open_new_connection_internal(
        &self,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<ConnectionStatus<B::Connection>>> {
        let connection = self.backend.open_connection(definition)?;
        let status = Arc::new(ConnectionStatus::new(connection, definition.clone(), true));
        debug!(
            engine = %self.name,
            propagation = %definition.propagation(),
            "opened new connection"
        );

        if let Err(err) = self.backend.setup_connection(&status) {
            let err = ConnectionError::from(err);
            return Err(match self.complete(&status) {
                Ok(()) => err,
                Err(close_err) => err.with_suppressed(vec![close_err]),
            });
        }

        let element = self.element(&status);
        PropagatedContext::current()
            .plus(Arc::clone(&element))
            .install();
        status.register_shared(Arc::new(ContextRestore::Remove(element)));
        Ok(status)
    }

    fn reuse_existing_connection_internal(
        &self,
        existing: Element<B::Connection>,
    ) -> Result<Arc<ConnectionStatus<B::Connection>>> {
        let status = Arc::new(Self::reused_status(&existing));
        debug!(engine = %self.name, "reusing connection in scope");
        self.backend.setup_connection(&status)?;

        let element = self.element(&status);
        PropagatedContext::current()
            .replace(&existing, Arc::clone(&element))
            .install();
        status.register_shared(Arc::new(ContextRestore::Replace {
            current: element,
            previous: existing,
        }));
        Ok(status)
    }

    fn suspend_open_connection(
        &self,
        existing: Element<B::Connection>,
        definition: &ConnectionDefinition,
    ) -> Result<Arc<ConnectionStatus<B::Connection>>> {
        debug!(engine = %self.name, "suspending connection in scope");
        PropagatedContext::current().minus(&existing).install();
        match self.open_new_connection_internal(definition) {
            Ok(status) => {
                status.register_shared(Arc::new(ContextRestore::Resume(existing)));
                Ok(status)
            }
            Err(err) => {
                PropagatedContext::current().plus(existing).install();
                Err(err)
            }
        }
    }

    // --- Completion ---

    /// Completes a scope obtained from [`get_connection`](Self::get_connection)
    /// (also used internally by [`execute`](Self::execute)).
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::AlreadyCompleted`] if `status` was completed
    ///   before; nothing else runs in that case
    /// - the first failure among synchronizations and the close hook, with
    ///   later failures attached as suppressed errors
    pub fn complete(&self, status: &ConnectionStatus<B::Connection>) -> Result<()> {
        let synchronizations = status.mark_completed()?;
        let mut errors = Vec::new();
        fire_stage(&synchronizations, SynchronizationStage::ExecutionComplete, &mut errors);
        fire_stage(&synchronizations, SynchronizationStage::BeforeClosed, &mut errors);
        if status.is_new() {
            match self.backend.close_connection(status) {
                Ok(()) => debug!(engine = %self.name, "closed connection"),
                Err(err) => errors.push(ConnectionError::Backend(err)),
            }
        }
        fire_stage(&synchronizations, SynchronizationStage::AfterClosed, &mut errors);

        let mut errors = errors.into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let suppressed: Vec<ConnectionError> = errors.collect();
        for err in &suppressed {
            warn!(
                engine = %self.name,
                error = %err,
                "suppressed error while completing connection"
            );
        }
        Err(first.with_suppressed(suppressed))
    }

    fn element(&self, status: &Arc<ConnectionStatus<B::Connection>>) -> Element<B::Connection> {
        Arc::new(ConnectionContextElement {
            owner: self.id,
            status: Arc::clone(status),
        })
    }

    fn reused_status(existing: &Element<B::Connection>) -> ConnectionStatus<B::Connection> {
        ConnectionStatus::new(
            existing.status.connection().clone(),
            existing.status.definition().clone(),
            false,
        )
    }
}

impl<B: ConnectionBackend> fmt::Debug for ConnectionOperations<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOperations")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("customizers", &self.customizers.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CompletionGuard
// ---------------------------------------------------------------------------

/// Completes a scoped status exactly once: through [`finish`](Self::finish)
/// on return, or on drop while unwinding from a panicking unit of work.
struct CompletionGuard<'a, B: ConnectionBackend> {
    operations: &'a ConnectionOperations<B>,
    status: Option<Arc<ConnectionStatus<B::Connection>>>,
}

impl<'a, B: ConnectionBackend> CompletionGuard<'a, B> {
    fn new(operations: &'a ConnectionOperations<B>, status: Arc<ConnectionStatus<B::Connection>>) -> Self {
        Self {
            operations,
            status: Some(status),
        }
    }

    fn finish(mut self, result: Result<()>) -> Result<()> {
        let Some(status) = self.status.take() else {
            return result;
        };
        match (result, self.operations.complete(&status)) {
            (Ok(()), completion) => completion,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(completion_err)) => {
                warn!(
                    engine = %self.operations.name,
                    error = %completion_err,
                    "completion failed after unit of work error"
                );
                Err(err.with_suppressed(vec![completion_err]))
            }
        }
    }
}

impl<B: ConnectionBackend> Drop for CompletionGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(status) = self.status.take() {
            if let Err(err) = self.operations.complete(&status) {
                warn!(
                    engine = %self.operations.name,
                    error = %err,
                    "completion failed while unwinding"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ContextRestore
// ---------------------------------------------------------------------------

/// Reverses the ambient-context change made by `get_connection` once the
/// status completes.
enum ContextRestore<C> {
    /// A new connection was published: take it out again.
    Remove(Element<C>),
    /// A reused connection replaced the outer element: put the outer one back.
    Replace {
        current: Element<C>,
        previous: Element<C>,
    },
    /// An outer element was suspended: bring it back.
    Resume(Element<C>),
}

impl<C: Send + Sync + 'static> ConnectionSynchronization for ContextRestore<C> {
    fn execution_complete(&self) -> anyhow::Result<()> {
        let context = PropagatedContext::current();
        let restored = match self {
            Self::Remove(element) => context.minus(element),
            Self::Replace { current, previous } => context.replace(current, Arc::clone(previous)),
            Self::Resume(element) if context.contains(element) => context,
            Self::Resume(element) => context.plus(Arc::clone(element)),
        };
        restored.install();
        Ok(())
    }
}
