//! Ambient propagated context.
//!
//! A [`PropagatedContext`] is an immutable, stack-like set of typed elements
//! visible to the current logical call chain. `plus`, `minus` and `replace`
//! never mutate: they return a new context that the caller installs
//! explicitly.
//!
//! The installed context is thread-local. [`PropagatedContext::propagate`]
//! installs a context and returns a [`PropagatedContextScope`] guard that
//! puts the previous one back when dropped, including during unwinding.
//! Work handed to another flow must carry its context explicitly with
//! [`PropagatedContext::wrap`].

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

type Element = Arc<dyn Any + Send + Sync>;

thread_local! {
    static CURRENT: RefCell<PropagatedContext> = RefCell::new(PropagatedContext::empty());
}

/// Immutable snapshot of ambient elements. Cloning is cheap.
///
/// Elements are compared by identity: `minus` and `replace` match the exact
/// `Arc` that was passed to `plus`.
#[derive(Clone)]
pub struct PropagatedContext {
    elements: Arc<[Element]>,
}

impl PropagatedContext {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            elements: Arc::from(Vec::new()),
        }
    }

    /// Snapshot of the context installed on this thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT
            .try_with(|current| current.borrow().clone())
            .unwrap_or_else(|_| Self::empty())
    }

    /// Same as [`current`](Self::current); the installed context is never absent.
    #[must_use]
    pub fn get_or_empty() -> Self {
        Self::current()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// New context with `element` on top.
    #[must_use]
    pub fn plus<T: Any + Send + Sync>(&self, element: Arc<T>) -> Self {
        let mut elements = self.elements.to_vec();
        elements.push(element);
        Self {
            elements: elements.into(),
        }
    }

    /// New context without `element`. Unknown elements are ignored.
    #[must_use]
    pub fn minus<T: Any + Send + Sync>(&self, element: &Arc<T>) -> Self {
        let elements: Vec<Element> = self
            .elements
            .iter()
            .filter(|candidate| !same_element(candidate, element))
            .cloned()
            .collect();
        Self {
            elements: elements.into(),
        }
    }

    /// New context where `old` is swapped for `new` in place. When `old` is
    /// not present, `new` is added on top.
    #[must_use]
    pub fn replace<T, U>(&self, old: &Arc<T>, new: Arc<U>) -> Self
    where
        T: Any + Send + Sync,
        U: Any + Send + Sync,
    {
        let Some(index) = self.elements.iter().position(|e| same_element(e, old)) else {
            return self.plus(new);
        };
        let mut elements = self.elements.to_vec();
        elements[index] = new as Element;
        Self {
            elements: elements.into(),
        }
    }

    #[must_use]
    pub fn contains<T: Any + Send + Sync>(&self, element: &Arc<T>) -> bool {
        self.elements.iter().any(|e| same_element(e, element))
    }

    /// Lazily yields every element of type `T`, most recently added first.
    ///
    /// The iterator borrows this snapshot, so calling `find_all` again
    /// restarts from the top.
    pub fn find_all<T: Any + Send + Sync>(&self) -> impl Iterator<Item = Arc<T>> + '_ {
        self.elements
            .iter()
            .rev()
            .filter_map(|element| Arc::clone(element).downcast::<T>().ok())
    }

    /// First element of type `T` matching `predicate`.
    pub fn find<T, P>(&self, mut predicate: P) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        P: FnMut(&T) -> bool,
    {
        self.find_all::<T>().find(|element| predicate(element))
    }

    /// Installs this context on the current thread until the returned guard
    /// is dropped.
    #[must_use = "the context is uninstalled as soon as the scope is dropped"]
    pub fn propagate(self) -> PropagatedContextScope {
        PropagatedContextScope {
            previous: Some(self.install()),
            _not_send: PhantomData,
        }
    }

    /// Installs this context on the current thread without a guard and
    /// returns the context it replaced. The caller owns restoration.
    pub fn install(self) -> PropagatedContext {
        CURRENT
            .try_with(|current| current.replace(self))
            .unwrap_or_else(|_| Self::empty())
    }

    /// Carries this context into `future`: it is installed for the duration
    /// of every poll, and changes made while polling are kept for the next
    /// poll.
    pub fn wrap<F: Future>(self, future: F) -> PropagatedFuture<F> {
        PropagatedFuture {
            context: self,
            inner: Box::pin(future),
        }
    }
}

impl Default for PropagatedContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PropagatedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagatedContext")
            .field("elements", &self.elements.len())
            .finish()
    }
}

fn same_element<T: Any + Send + Sync>(candidate: &Element, element: &Arc<T>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(candidate).cast::<()>(),
        Arc::as_ptr(element).cast::<()>(),
    )
}

// ---------------------------------------------------------------------------
// PropagatedContextScope
// ---------------------------------------------------------------------------

/// Guard returned by [`PropagatedContext::propagate`]. Restores the previously
/// installed context on drop. Not `Send`: it must be dropped on the thread
/// that created it.
pub struct PropagatedContextScope {
    previous: Option<PropagatedContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for PropagatedContextScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Thread-local may already be gone during thread teardown. The
            // replaced context is dropped after the cell is released: element
            // `Drop` impls may read the current context.
            let replaced = CURRENT.try_with(|current| current.replace(previous));
            drop(replaced);
        }
    }
}

impl fmt::Debug for PropagatedContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagatedContextScope").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// PropagatedFuture
// ---------------------------------------------------------------------------

/// Future that runs `F` under a captured [`PropagatedContext`].
pub struct PropagatedFuture<F> {
    context: PropagatedContext,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for PropagatedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let scope = this.context.clone().propagate();
        let result = this.inner.as_mut().poll(cx);
        this.context = PropagatedContext::current();
        drop(scope);
        result
    }
}

impl<F> fmt::Debug for PropagatedFuture<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagatedFuture")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
