//! `connscope` Engine: connection propagation, completion protocol, customizers, and backends.

pub mod backend;
pub mod backends;
pub mod customizer;
pub mod operations;
pub mod status;
pub mod telemetry;

pub use backend::ConnectionBackend;
pub use backends::{ConnectionSettings, MemoryBackend, MemoryConnection};
pub use customizer::{ConnectionCustomizer, CustomizerChain, TracingCustomizer, UnitOfWork};
pub use operations::{ConnectionOperations, OperationsId};
pub use status::{ConnectionStatus, ConnectionSynchronization, SynchronizationStage};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};

pub use connscope_core::{
    ConnectionDefinition, ConnectionError, Isolation, PropagatedContext, Propagation, Result,
};
