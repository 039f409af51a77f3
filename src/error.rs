use std::io;
use thiserror::Error;

use hyper::StatusCode;

/// Boxed error returned by interceptors and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while an exchange is being processed.
///
/// The state variants (`Committed`, `OwnershipTransferred`, `AsyncStarted`,
/// `Recycled`, `Unsupported`, `StreamClosed`) are precondition failures and
/// are surfaced to the caller immediately.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The response head has already been sent.
    #[error("cannot perform this operation after the response has been committed")]
    Committed,

    /// Output was handed to an asynchronous response.
    #[error("response output ownership was transferred to an async response")]
    OwnershipTransferred,

    /// `start_async` was called twice for the same response.
    #[error("async processing was already started for this response")]
    AsyncStarted,

    /// A pooled object was used after it went back to its pool.
    #[error("{0} was used after it was recycled")]
    Recycled(&'static str),

    /// The operation is not allowed on this object.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Writes after the response stream was closed.
    #[error("response stream is closed")]
    StreamClosed,

    /// A character encoding the writer cannot produce.
    #[error("unsupported character encoding: {0}")]
    UnsupportedCharset(String),

    /// A handler or interceptor asked for a specific error status.
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    /// Error returned by an interceptor or handler.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// An interceptor or handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    /// Wraps an arbitrary handler error.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        ExchangeError::Handler(err.into())
    }

    /// Shorthand for an error that maps to a specific response status.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        ExchangeError::Status {
            status,
            message: message.into(),
        }
    }

    /// Whether this is a precondition failure rather than a handler failure.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            ExchangeError::Committed
                | ExchangeError::OwnershipTransferred
                | ExchangeError::AsyncStarted
                | ExchangeError::Recycled(_)
                | ExchangeError::Unsupported(_)
                | ExchangeError::StreamClosed
        )
    }

    /// Status code used when this error is turned into an error response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExchangeError::Status { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ExchangeError> for io::Error {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Errors raised by registrar start/stop hooks.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// One or more interceptors or handlers failed to initialize.
    #[error("initialization failed for: {}", failed.join(", "))]
    InitFailed { failed: Vec<String> },

    /// The TLS context could not be built.
    #[error("tls context: {0}")]
    Tls(String),

    /// Two handlers map the same URL pattern.
    #[error("handler pattern {pattern} is mapped twice")]
    DuplicatePattern { pattern: String },
}

/// Represents errors that can occur during task execution in the executor system.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),
}

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    #[error("registration failed: {0}")]
    Registration(io::Error),

    #[error("polling failed: {0}")]
    Polling(io::Error),

    #[error("mutex lock poisoned")]
    LockPoisoned,
}

impl From<ReactorError> for io::Error {
    fn from(err: ReactorError) -> Self {
        match err {
            ReactorError::Init(e) | ReactorError::Registration(e) | ReactorError::Polling(e) => e,
            ReactorError::LockPoisoned => io::Error::new(io::ErrorKind::Other, "reactor lock poisoned"),
        }
    }
}

/// Results of exchange processing.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Errors that keep a [`Server`](crate::Server) from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("no protocol registrars configured")]
    NoRegistrars,

    #[error("failed to start acceptor thread: {0}")]
    Acceptor(#[source] io::Error),
}

/// Type alias for Results using ExecutorError as the error type
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// State violations are classified apart from handler failures.
    #[test]
    fn test_state_violation_classification() {
        assert!(ExchangeError::Committed.is_state_violation());
        assert!(ExchangeError::OwnershipTransferred.is_state_violation());
        assert!(ExchangeError::Recycled("request").is_state_violation());
        assert!(!ExchangeError::handler("boom").is_state_violation());
        assert!(!ExchangeError::Panicked("boom".into()).is_state_violation());
    }

    /// Handler errors map to 500 unless they carry a status.
    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            ExchangeError::handler("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let err = ExchangeError::status(StatusCode::FORBIDDEN, "denied");
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "403 Forbidden: denied");
    }

    /// Tests the automatic conversion from io::Error to ExchangeError
    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let err = ExchangeError::from(io_err);

        assert!(matches!(err, ExchangeError::Io(_)));
        assert_eq!(err.to_string(), "io error: test error");
    }

    /// Lifecycle failures list every registration that failed.
    #[test]
    fn test_lifecycle_error_display() {
        let err = LifecycleError::InitFailed {
            failed: vec!["auth".into(), "static".into()],
        };
        assert_eq!(err.to_string(), "initialization failed for: auth, static");
    }

    /// Reactor errors unwrap back into the io error they carry.
    #[test]
    fn test_reactor_error_into_io() {
        let err = ReactorError::Polling(io::Error::new(io::ErrorKind::Other, "poll"));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.to_string(), "poll");
    }
}
