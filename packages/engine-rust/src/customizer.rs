//! Connection customizers: decorators wrapped around the unit of work.
//!
//! Customizers compose like middleware layers. The chain is kept sorted by
//! ascending [`ConnectionCustomizer::order`]; the lowest order wraps last and
//! therefore runs outermost:
//!
//! ```text
//! order 5 ─┐
//!   order 10 ─┐
//!     order 20 ─┐
//!       unit of work
//! ```

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use connscope_core::Result;

use crate::status::ConnectionStatus;

/// Type-erased unit of work as seen by customizers.
///
/// The engine keeps the typed result of the caller's callback on its side,
/// so customizers only observe success or failure.
pub type UnitOfWork<'a, C> = Box<dyn FnOnce(&ConnectionStatus<C>) -> Result<()> + 'a>;

/// Intercepts a unit of work before the engine dispatches it.
///
/// `intercept` may wrap `work` (run code before and after it) or replace it.
///
/// # Replacing the unit of work
///
/// [`UnitOfWork`] is type-erased to `Result<()>`: the caller's typed result
/// is produced only by running the original `work`. A replacement can
/// therefore veto the call but cannot substitute a value:
///
/// - a replacement returning `Err(e)` makes `execute` return `e`
/// - a replacement returning `Ok(())` without running `work` makes
///   `execute` return [`ConnectionError::NotExecuted`](connscope_core::ConnectionError::NotExecuted)
///
/// In both cases the scope is still completed.
pub trait ConnectionCustomizer<C>: Send + Sync {
    /// Position in the chain; lower runs further outside.
    fn order(&self) -> i32 {
        0
    }

    fn intercept<'a>(&'a self, work: UnitOfWork<'a, C>) -> UnitOfWork<'a, C>;
}

// ---------------------------------------------------------------------------
// CustomizerChain
// ---------------------------------------------------------------------------

/// Ordered, copy-on-write list of customizers owned by one engine instance.
///
/// Readers take a snapshot without locking; registration swaps in a new,
/// re-sorted list.
pub struct CustomizerChain<C> {
    customizers: ArcSwap<Vec<Arc<dyn ConnectionCustomizer<C>>>>,
}

impl<C> CustomizerChain<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            customizers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Adds `customizer` and re-sorts the chain. The sort is stable, so
    /// customizers with equal order keep registration order.
    pub fn add(&self, customizer: Arc<dyn ConnectionCustomizer<C>>) {
        self.customizers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&customizer));
            next.sort_by_key(|c| c.order());
            next
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.customizers.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.customizers.load().is_empty()
    }

    /// Current list, sorted by ascending order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn ConnectionCustomizer<C>>>> {
        self.customizers.load_full()
    }

    /// Wraps `work` with every customizer in `chain`. The first entry of
    /// `chain` ends up outermost.
    pub fn apply<'a>(
        chain: &'a [Arc<dyn ConnectionCustomizer<C>>],
        work: UnitOfWork<'a, C>,
    ) -> UnitOfWork<'a, C> {
        chain
            .iter()
            .rev()
            .fold(work, |work, customizer| customizer.intercept(work))
    }
}

impl<C> Default for CustomizerChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// TracingCustomizer
// ---------------------------------------------------------------------------

/// Runs every unit of work inside a `tracing` span and records its duration
/// and outcome.
#[derive(Debug, Clone)]
pub struct TracingCustomizer {
    order: i32,
}

impl TracingCustomizer {
    #[must_use]
    pub fn new(order: i32) -> Self {
        Self { order }
    }
}

impl Default for TracingCustomizer {
    /// Outermost by default so the span covers every other customizer.
    fn default() -> Self {
        Self::new(i32::MIN)
    }
}

impl<C: 'static> ConnectionCustomizer<C> for TracingCustomizer {
    fn order(&self) -> i32 {
        self.order
    }

    fn intercept<'a>(&'a self, work: UnitOfWork<'a, C>) -> UnitOfWork<'a, C> {
        Box::new(move |status: &ConnectionStatus<C>| -> Result<()> {
            let definition = status.definition();
            let span = tracing::debug_span!(
                "unit_of_work",
                name = definition.name().unwrap_or_default(),
                propagation = %definition.propagation(),
                is_new = status.is_new(),
                duration_ms = tracing::field::Empty,
                outcome = tracing::field::Empty,
            );
            let _entered = span.enter();

            let start = Instant::now();
            let result = work(status);

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            span.record("duration_ms", duration_ms);
            span.record("outcome", outcome);
            tracing::debug!(duration_ms, outcome, "unit of work complete");

            result
        })
    }
}
