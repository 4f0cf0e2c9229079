use std::borrow::Cow;
use std::error::Error;
use std::fmt;

/// `CoreError` is the stable error domain shared across every layer of a
/// spark stream pipeline.
///
/// # Why
/// Transports, filters, and the engine itself each see different failure
/// modes (a refused connect, a handshake alert, a latched I/O error); they
/// need to converge on one error shape so that logs, metrics, and a host
/// application's error handling don't have to special-case each layer.
///
/// # What
/// - `code`: a stable `'static` string, by convention `<domain>.<reason>`.
/// - `message`: a human-readable description for whoever is debugging.
/// - `cause`: an optional boxed lower-level error, preserving the chain.
///
/// Construct with [`CoreError::new`], optionally chain a cause with
/// [`CoreError::with_cause`], and tag a [`ErrorCategory`] with
/// [`CoreError::with_category`] when the error should drive automatic
/// retry/close behavior upstream.
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

/// Boxed lower-level cause, kept `Send + Sync` so it can cross threads.
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// Alias for the crate's default `Result`, matching the convention used
/// throughout the pipeline crates built on top of `spark-core`.
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

impl CoreError {
    /// Construct a core error from a stable code and a message.
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// Attach a lower-level cause, consuming and returning `self`.
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Set a lower-level cause in place.
    pub fn set_cause(&mut self, cause: impl Error + Send + Sync + 'static) {
        self.cause = Some(Box::new(cause));
    }

    /// Tag this error with a structured [`ErrorCategory`].
    ///
    /// Most callers that only need the stable code/message can skip this;
    /// it exists for sites that want to drive retry or close behavior off
    /// an error without re-deriving it from the code string.
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Read the structured category, defaulting to `NonRetryable` when the
    /// error was never explicitly categorized.
    pub fn category(&self) -> ErrorCategory {
        self.category.clone().unwrap_or(ErrorCategory::NonRetryable)
    }

    /// The stable error code.
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The lower-level cause, if one was attached.
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// Structured disposition of an error, used to drive automatic retry,
/// backpressure, or close behavior without re-parsing the stable code.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Worth retrying, possibly after a backoff.
    Retryable,
    /// Not worth retrying as-is.
    NonRetryable,
    /// The peer or protocol violated the contract; the pipeline should
    /// close rather than continue.
    ProtocolViolation,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// The operation ran past its deadline.
    Timeout,
}

/// Stable error codes shared by the stream-engine crates.
///
/// Kept as a flat module of constants (rather than an enum) so that
/// downstream LL/filter implementations can mint their own codes in the
/// same `<domain>.<reason>` style without needing to extend an enum defined
/// here.
pub mod codes {
    /// The pipeline is not in `OPEN`; a write or similar data-path
    /// operation was attempted outside that state.
    pub const NOT_OPEN: &str = "engine.not_open";
    /// An `open`/`close` call was made while the pipeline was already busy
    /// with an incompatible transition.
    pub const BUSY: &str = "engine.busy";
    /// An async continuation will follow; not itself a failure.
    pub const IN_PROGRESS: &str = "engine.in_progress";
    /// The lower layer latched a communication error.
    pub const COMM_ERROR: &str = "engine.comm_error";
    /// Allocation failed during construction.
    pub const NO_MEMORY: &str = "engine.no_memory";
}
