//! Error handling for spotweb.
//!
//! Every failure is classified into an [`ErrorKind`] that tells the caller
//! which stage of the client gave up:
//! * Transport: the HTTP retry budget or the socket gave out
//! * Session: token bootstrap, client token exchange, hash discovery
//! * Auth / Challenge: login, registration and password reset flows
//! * Captcha: vendor task errors and exhausted polling
//! * Realtime channel and player control
//! * Validation: upstream responses that do not match the expected shape
//!
//! Errors carry a human-readable message and, when the remote side supplied
//! one, the raw upstream error string.
//!
//! # Example
//!
//! ```rust
//! use spotweb::error::{Error, ErrorKind, Result};
//!
//! fn check(result: &str) -> Result<()> {
//!     if result != "ok" {
//!         return Err(Error::auth("unforeseen error").with_upstream(result));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,

    /// Raw error string reported by the remote service, if any
    pub upstream: Option<String>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// # Returns
    /// * `Some(&E)` - If the underlying error is of type `E`
    /// * `None` - If the underlying error is not of type `E`
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Attaches the raw upstream error string.
    #[must_use]
    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }
}

/// Standard result type for spotweb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// An HTTP request or socket operation failed after exhausting its
    /// retry budget.
    #[error("transport failure")]
    Transport,

    /// Access token, client token or query hash bootstrap failed.
    #[error("session bootstrap failed")]
    Session,

    /// Login, registration or password reset failed, including rejected
    /// credentials and unexpected response shapes.
    #[error("authentication failed")]
    Auth,

    /// The interactive challenge sub-flow failed.
    #[error("challenge failed")]
    Challenge,

    /// The captcha vendor reported a non-zero error code.
    #[error("captcha task failed")]
    CaptchaTask,

    /// The captcha polling budget was exhausted without a solution.
    #[error("captcha solving timed out")]
    CaptchaTimeout,

    /// Socket, device registration or connect-state failure.
    #[error("realtime channel failure")]
    RealtimeChannel,

    /// A player command was rejected.
    #[error("player command failed")]
    Player,

    /// A response did not match the shape expected at that step.
    #[error("unexpected response")]
    Validation,

    /// A caller supplied an argument outside its valid domain.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// The operation is not valid in the current state.
    #[error("invalid state")]
    FailedPrecondition,

    /// Unexpected local failure.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::Session, "could not get session");
    /// assert_eq!(err.kind, ErrorKind::Session);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
            upstream: None,
        }
    }

    /// Creates an error for requests that kept failing after all retries.
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Transport, error)
    }

    /// Creates an error for token and hash bootstrap failures.
    pub fn session<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Session, error)
    }

    /// Creates an error for failed login, registration or reset flows.
    pub fn auth<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Auth, error)
    }

    /// Creates an error for a failed interactive challenge.
    pub fn challenge<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Challenge, error)
    }

    /// Creates an error for a captcha vendor error code.
    ///
    /// A fresh task is unlikely to help; callers usually give up.
    pub fn captcha_task<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::CaptchaTask, error)
    }

    /// Creates an error for an exhausted captcha polling budget.
    ///
    /// Unlike [`captcha_task`](Self::captcha_task), creating a fresh task
    /// may succeed.
    pub fn captcha_timeout<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::CaptchaTimeout, error)
    }

    /// Creates an error for socket, registration and connect-state failures.
    pub fn realtime<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::RealtimeChannel, error)
    }

    /// Creates an error for rejected player commands.
    pub fn player<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Player, error)
    }

    /// Creates an error for malformed or unexpected responses.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::validation("invalid init packet");
    /// assert_eq!(err.kind, ErrorKind::Validation);
    /// ```
    pub fn validation<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Validation, error)
    }

    /// Creates an error for invalid arguments.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::invalid_argument("volume must be between 0.0 and 1.0");
    /// assert_eq!(err.kind, ErrorKind::InvalidArgument);
    /// ```
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for operations that cannot proceed in the current
    /// state.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::failed_precondition("must be logged in");
    /// assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    /// ```
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FailedPrecondition, error)
    }

    /// Creates an error for unexpected local failures.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as `"{kind}: {details}"`, followed by the upstream
/// error in parentheses when present.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)?;
        if let Some(upstream) = &self.upstream {
            write!(fmt, " ({upstream})")?;
        }
        Ok(())
    }
}

/// Converts IO errors. Malformed data maps to `Validation`, everything
/// else is treated as an internal failure.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            InvalidData | UnexpectedEof => Self::validation(err),
            InvalidInput | NotFound | PermissionDenied => Self::invalid_argument(err),
            BrokenPipe | ConnectionReset | ConnectionAborted | ConnectionRefused
            | NotConnected | TimedOut => Self::transport(err),
            _ => Self::internal(err),
        }
    }
}

/// Converts HTTP client errors.
///
/// Decode errors mean the remote side changed its response shape; builder
/// errors are local bugs; everything else is a transport failure.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::validation(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        Self::transport(err)
    }
}

/// Converts WebSocket errors.
///
/// Malformed frames map to `Validation`; everything else means the
/// realtime channel is unusable.
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            Utf8 | Capacity(_) => Self::validation(err),
            Url(_) => Self::invalid_argument(err),
            _ => Self::realtime(err),
        }
    }
}

/// JSON errors always mean an unexpected shape.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts header size errors to `Internal`.
impl From<http::header::MaxSizeReached> for Error {
    fn from(e: http::header::MaxSizeReached) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts invalid header errors to `InvalidArgument`.
///
/// Header values are built from tokens and identifiers that callers or the
/// remote side supplied.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts cookie store errors to `InvalidArgument`.
impl From<cookie_store::CookieError> for Error {
    fn from(e: cookie_store::CookieError) -> Self {
        Self::invalid_argument(e)
    }
}

impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}
