//! Error handling for spotlink.
//!
//! Provides a unified error type whose [`ErrorKind`] follows the failure
//! taxonomy of the access point and relay protocols, with mapping from the
//! underlying I/O, HTTP, WebSocket and codec errors to those categories.
//!
//! # Error Categories
//!
//! * Transport failures: the socket is gone and the connection is dead
//! * Handshake failures: the key exchange could not be verified
//! * Authentication failures: the server rejected the credentials
//! * Mercury status: a request completed with a non-success status
//! * Cancellation and deadlines
//! * Local problems: invalid input, corrupt data, internal errors
//!
//! Callers never see a raw socket error: I/O errors are folded into
//! [`ErrorKind::Transport`] (or a timeout/cancellation kind) at the
//! transport boundary.
//!
//! # Example
//!
//! ```rust
//! use spotlink::error::{Error, ErrorKind, Result};
//!
//! async fn metadata(mercury: &Mercury, uri: &str) -> Result<Bytes> {
//!     match mercury.get(uri).await {
//!         Ok(response) => Ok(response.body()),
//!         Err(e) if e.status().is_some_and(|s| s.is_retryable()) => {
//!             // back off and try again later
//!             Err(e)
//!         }
//!         Err(e) => Err(e),
//!     }
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details, including typed details for
///   authentication failures ([`AuthFailure`]) and Mercury status codes
///   ([`StatusError`])
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for spotlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of the access point and relay protocols.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The operation was cancelled by the caller.
    #[error("operation was cancelled")]
    Cancelled,

    /// A bounded wait ran out.
    #[error("operation timed out")]
    DeadlineExceeded,

    /// The socket failed or was closed. The connection is dead and must be
    /// re-established.
    #[error("transport failure")]
    Transport,

    /// The key exchange failed or could not be verified. There is no
    /// fallback: the connection attempt is abandoned.
    #[error("handshake failed")]
    Handshake,

    /// The server rejected the credentials.
    #[error("authentication failed")]
    Unauthenticated,

    /// A Mercury request completed with a non-success status code.
    #[error("mercury request failed")]
    MercuryStatus,

    /// The caller supplied an invalid value.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// Data received from the peer is corrupt or cannot be decoded.
    #[error("unrecoverable data loss or corruption")]
    DataLoss,

    /// A remote service is not available.
    #[error("service unavailable")]
    Unavailable,

    /// An invariant of this crate was violated.
    #[error("internal error")]
    Internal,

    /// Anything that does not fit another category.
    #[error("unknown error")]
    Unknown,
}

/// A login-failed response from the access point.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Error)]
#[error("{description} (code {code})")]
pub struct AuthFailure {
    /// Numeric error code as sent by the server.
    pub code: i32,

    /// Human-readable reason, or the name of the error code when the server
    /// did not send one.
    pub description: String,
}

/// A Mercury response with a status code outside the success range.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("status {code} for {uri}")]
pub struct StatusError {
    /// Status code from the response header.
    pub code: i32,

    /// URI the response was for.
    pub uri: String,

    /// Raw payload parts of the response.
    pub payload: Vec<Bytes>,
}

impl StatusError {
    /// Whether retrying the same request later can succeed.
    ///
    /// True for rate limiting (429) and server-side failures (5xx).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code == 429 || (500..600).contains(&self.code)
    }
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

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

    /// The server-provided login failure, if this error carries one.
    #[must_use]
    pub fn auth_failure(&self) -> Option<&AuthFailure> {
        self.downcast::<AuthFailure>()
    }

    /// The Mercury status, if this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<&StatusError> {
        self.downcast::<StatusError>()
    }

    /// Whether this error means the underlying connection can no longer be
    /// used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::Handshake | ErrorKind::DataLoss
        )
    }

    /// Creates an error for cancelled operations.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for operations that exceeded their deadline.
    ///
    /// Use when:
    /// * A handshake step times out
    /// * A Mercury round trip times out
    /// * A token or discovery lookup times out
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeadlineExceeded, error)
    }

    /// Creates an error for a dead or failing connection.
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Transport, error)
    }

    /// Creates an error for a failed or unverifiable key exchange.
    pub fn handshake<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Handshake, error)
    }

    /// Creates an error for authentication failures.
    ///
    /// Use [`Error::login_failed`] when the server sent a typed failure.
    pub fn unauthenticated<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unauthenticated, error)
    }

    /// Creates an authentication error carrying the server's code and
    /// description.
    #[must_use]
    pub fn login_failed(code: i32, description: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Unauthenticated,
            AuthFailure {
                code,
                description: description.into(),
            },
        )
    }

    /// Creates an error for a Mercury response with a non-success status.
    #[must_use]
    pub fn mercury_status(code: i32, uri: impl Into<String>, payload: Vec<Bytes>) -> Self {
        Self::new(
            ErrorKind::MercuryStatus,
            StatusError {
                code,
                uri: uri.into(),
                payload,
            },
        )
    }

    /// Creates an error for invalid arguments.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for corrupt or undecodable peer data.
    pub fn data_loss<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DataLoss, error)
    }

    /// Creates an error for unavailable services.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    /// Creates an error for internal errors.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Creates an error for unknown errors.
    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unknown, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display as `"{kind}: {details}"`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Socket-level failures all become `Transport`, so that nothing above the
/// transport has to reason about raw I/O errors:
/// * `TimedOut` -> `DeadlineExceeded`
/// * `Interrupted` -> `Cancelled`
/// * `InvalidData` -> `DataLoss`
/// * `InvalidInput` -> `InvalidArgument`
/// * everything else -> `Transport`
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut => Self::deadline_exceeded(err),
            Interrupted => Self::cancelled(err),
            InvalidData => Self::data_loss(err),
            InvalidInput => Self::invalid_argument(err),
            _ => Self::transport(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// * Body and decode errors -> `DataLoss`
/// * Builder errors -> `Internal`
/// * Connect errors -> `Unavailable`
/// * Status errors -> `Unavailable`
/// * Timeout errors -> `DeadlineExceeded`
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() || err.is_decode() {
            return Self::data_loss(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if err.is_connect() || err.is_status() || err.is_redirect() {
            return Self::unavailable(err);
        }

        Self::unknown(err)
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// * `ConnectionClosed`, `AlreadyClosed`, `Io` -> `Transport`
/// * `Capacity` -> `DataLoss`
/// * HTTP 401 and 403 during the upgrade -> `Unauthenticated`
/// * Other HTTP statuses -> `Unavailable`
/// * Others -> `Transport`
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        if let Http(response) = &err {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                return Self::unauthenticated(err);
            }
            return Self::unavailable(err);
        }

        match err {
            ConnectionClosed | AlreadyClosed => Self::transport(err),
            Io(err) => Self::transport(err),
            Capacity(err) => Self::data_loss(err),
            _ => Self::transport(err),
        }
    }
}

/// Converts JSON errors to `DataLoss`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::data_loss(err)
    }
}

/// Converts protocol buffer errors to `DataLoss`.
impl From<protobuf::Error> for Error {
    fn from(err: protobuf::Error) -> Self {
        Self::data_loss(err)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts Base64 decoding errors to `DataLoss`.
impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::data_loss(e.to_string())
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts UUID parsing errors to `InvalidArgument`.
impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts TOML parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts HMAC key length errors to `Internal`.
impl From<hmac::digest::InvalidLength> for Error {
    fn from(e: hmac::digest::InvalidLength) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts integer parsing errors to `InvalidArgument`.
impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts formatting errors to `Unknown`.
impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Self::unknown(e.to_string())
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts read-lock poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::RwLockReadGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::RwLockReadGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts write-lock poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::RwLockWriteGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::RwLockWriteGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}
