//! `ConnectionBackend` implementations.
//!
//! Provides concrete backends for the [`ConnectionBackend`](crate::ConnectionBackend) trait.
//! Currently includes [`MemoryBackend`] for testing and demos.

mod memory;

pub use memory::{ConnectionSettings, MemoryBackend, MemoryConnection};
