//! `connscope` Core: ambient propagated context, connection definitions, and the error taxonomy.

pub mod context;
pub mod definition;
pub mod error;

pub use context::{PropagatedContext, PropagatedContextScope, PropagatedFuture};
pub use definition::{ConnectionDefinition, Isolation, Propagation};
pub use error::{ConnectionError, Result, NO_CONNECTION_MESSAGE};
