use std::error::Error;
use std::fmt;

use spark_core::error::codes;
use spark_core::{CoreError, ErrorCategory};

/// Boxed lower-level cause, kept `Send + Sync` so it can cross the thread
/// that owns a lower-layer or filter callback.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The engine's closed, stable error set.
///
/// These five variants are deliberately the only ones the engine itself
/// ever returns or delivers to a user callback; a lower layer or filter
/// reports its own richer errors as the [`EngineError::CommError`] cause,
/// which this type preserves via `source()`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A data-path operation (write, enable toggle) was attempted while the
    /// pipeline was not in `OPEN`.
    #[error("stream is not open")]
    NotOpen,
    /// An `open`/`close` call arrived while the pipeline was already
    /// mid-transition and cannot accept a second one.
    #[error("operation not valid while a transition is already in progress")]
    Busy,
    /// Not itself a failure: the caller's completion will be invoked later.
    #[error("operation is asynchronous; completion follows")]
    InProgress,
    /// The lower layer or filter latched an I/O or protocol error.
    #[error("communication error")]
    CommError(#[source] BoxError),
    /// Allocation failed while constructing engine-owned state.
    #[error("allocation failed")]
    NoMemory,
}

impl EngineError {
    /// Wrap an arbitrary lower-layer/filter error as a [`EngineError::CommError`].
    pub fn comm_error(cause: impl Error + Send + Sync + 'static) -> Self {
        EngineError::CommError(Box::new(cause))
    }

    /// The stable `<domain>.<reason>` code for this variant, matching
    /// `spark_core::error::codes`.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotOpen => codes::NOT_OPEN,
            EngineError::Busy => codes::BUSY,
            EngineError::InProgress => codes::IN_PROGRESS,
            EngineError::CommError(_) => codes::COMM_ERROR,
            EngineError::NoMemory => codes::NO_MEMORY,
        }
    }

    /// The structured category used to decide retry/close behavior.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::NotOpen => ErrorCategory::NonRetryable,
            EngineError::Busy => ErrorCategory::Retryable,
            EngineError::InProgress => ErrorCategory::Cancelled,
            EngineError::CommError(_) => ErrorCategory::ProtocolViolation,
            EngineError::NoMemory => ErrorCategory::NonRetryable,
        }
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        let code = err.code();
        let category = err.category();
        let core = CoreError::new(code, err.to_string());
        let core = match err {
            EngineError::CommError(cause) => core.with_cause(Wrapped(cause)),
            _ => core,
        };
        core.with_category(category)
    }
}

/// Adapts a `Box<dyn Error + Send + Sync>` into a concrete `Error` so it can
/// be handed to `CoreError::with_cause`, which takes `impl Error` by value.
#[derive(Debug)]
struct Wrapped(BoxError);

impl fmt::Display for Wrapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for Wrapped {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = core::result::Result<T, EngineError>;
