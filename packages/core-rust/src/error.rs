//! Error taxonomy for connection propagation.
//!
//! Four kinds of failure reach callers:
//!
//! - configuration faults ([`ConnectionError::UnknownPropagation`],
//!   [`ConnectionError::UnknownIsolation`]), raised while parsing definitions
//! - absence ([`ConnectionError::NoConnection`]), raised by `MANDATORY` with
//!   nothing in scope
//! - backend failures ([`ConnectionError::Backend`]), passed through unchanged
//! - programming errors ([`ConnectionError::AlreadyCompleted`])
//!
//! None of them are retried by the engine.

/// Result alias used across the workspace.
pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;

/// Message carried by [`ConnectionError::NoConnection`] when raised by the engine.
pub const NO_CONNECTION_MESSAGE: &str =
    "No existing connection found for connection marked with propagation 'mandatory'";

/// Errors surfaced by the propagation engine.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("unknown propagation: {value}")]
    UnknownPropagation { value: String },
    #[error("unknown isolation level: {value}")]
    UnknownIsolation { value: String },
    #[error("{message}")]
    NoConnection { message: String },
    #[error("connection status has already been completed")]
    AlreadyCompleted,
    /// A customizer returned without running the unit of work it wrapped,
    /// so there is no result to hand back.
    #[error("connection customizer returned without running the unit of work")]
    NotExecuted,
    /// Failure raised by a backend hook or by the unit of work itself.
    /// The wrapped error is left untouched so callers can downcast it.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
    /// First failure of a completion sequence plus the failures that followed it.
    #[error("{source} ({} suppressed)", .suppressed.len())]
    Suppressed {
        source: Box<ConnectionError>,
        suppressed: Vec<ConnectionError>,
    },
}

impl ConnectionError {
    /// Absence error with the engine's standard message.
    #[must_use]
    pub fn no_connection() -> Self {
        Self::NoConnection {
            message: NO_CONNECTION_MESSAGE.to_string(),
        }
    }

    /// Attaches secondary errors to `self`. Returns `self` unchanged when
    /// `suppressed` is empty.
    #[must_use]
    pub fn with_suppressed(self, suppressed: Vec<ConnectionError>) -> Self {
        if suppressed.is_empty() {
            return self;
        }
        match self {
            Self::Suppressed {
                source,
                suppressed: mut existing,
            } => {
                existing.extend(suppressed);
                Self::Suppressed {
                    source,
                    suppressed: existing,
                }
            }
            primary => Self::Suppressed {
                source: Box::new(primary),
                suppressed,
            },
        }
    }

    /// The error that caused the failure, looking through [`Self::Suppressed`].
    #[must_use]
    pub fn primary(&self) -> &ConnectionError {
        match self {
            Self::Suppressed { source, .. } => source.primary(),
            other => other,
        }
    }

    /// Secondary errors collected during completion, if any.
    #[must_use]
    pub fn suppressed(&self) -> &[ConnectionError] {
        match self {
            Self::Suppressed { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    #[must_use]
    pub fn is_no_connection(&self) -> bool {
        matches!(self.primary(), Self::NoConnection { .. })
    }

    #[must_use]
    pub fn is_already_completed(&self) -> bool {
        matches!(self.primary(), Self::AlreadyCompleted)
    }

    /// Borrows the backend error, if the primary failure came from a backend.
    #[must_use]
    pub fn backend(&self) -> Option<&anyhow::Error> {
        match self.primary() {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}
