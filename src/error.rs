//! Error types for connection-lifecycle operations.

use std::io;
use thiserror::Error;

use crate::session::ConnectionStatus;
use crate::types::Identity;

/// Broad failure classification consulted by retry policies.
///
/// Retryability is a property of the kind itself, never inferred from the
/// shape or name of the underlying error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A network blip. Retryable as-is.
    Transient,
    /// A bad or expired credential. Retryable only after renewal.
    Authentication,
    /// A malformed or unsupported protocol operation. Not retryable.
    Protocol,
    /// A misconfiguration. Not retryable, surfaced immediately.
    Fatal,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Authentication)
    }
}

/// Errors that can occur while managing a device connection.
///
/// Every variant is cheap to clone so a failure can surface through a
/// status-change event and still be returned to a synchronous caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// I/O failure reported by the protocol layer.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },

    /// An operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The remote end dropped the connection.
    #[error("Connection dropped by remote")]
    ConnectionDropped,

    /// The network path is gone entirely.
    #[error("Network unreachable")]
    NoNetwork,

    /// The active credential has passed its expiry.
    #[error("Credential for {0} has expired")]
    CredentialExpired(Identity),

    /// The service rejected the presented credential.
    #[error("Credential rejected: {0}")]
    CredentialRejected(String),

    /// The credential provider failed to produce a credential.
    #[error("Credential provider failed: {0}")]
    Provider(String),

    /// A credential was constructed with a non-positive lifetime.
    #[error("Invalid credential: {0}")]
    InvalidCredential(&'static str),

    /// The protocol layer reported a malformed or unsupported operation.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A runtime option a collaborator cannot honor.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A reserved message property name was used by the application.
    #[error("\"{0}\" is a reserved property name")]
    ReservedPropertyName(String),

    /// A message property contained non-ASCII data.
    #[error("Message property \"{0}\" is not US-ASCII")]
    NonAsciiProperty(String),

    /// The requested status transition is not a legal edge.
    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    /// A status listener was registered from inside a listener callback.
    #[error("A status listener is currently being notified")]
    ListenerBusy,

    /// A session with this identity is already registered.
    #[error("Session for {0} is already registered")]
    DuplicateIdentity(Identity),

    /// No session with this identity is registered.
    #[error("Session for {0} is not registered")]
    UnknownIdentity(Identity),

    /// The session was closed by the caller and accepts no further work.
    #[error("Session is closed")]
    SessionClosed,

    /// The operation requires an open connection.
    #[error("Connection is not open")]
    NotConnected,
}

/// Result type alias for connection-lifecycle operations.
pub type Result<T> = std::result::Result<T, LinkError>;

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        LinkError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl LinkError {
    /// Classify this error for retry purposes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Io { .. }
            | LinkError::Timeout
            | LinkError::ConnectionDropped
            | LinkError::NoNetwork => ErrorKind::Transient,
            LinkError::CredentialExpired(_)
            | LinkError::CredentialRejected(_)
            | LinkError::Provider(_) => ErrorKind::Authentication,
            LinkError::Protocol(_) => ErrorKind::Protocol,
            LinkError::InvalidCredential(_)
            | LinkError::UnsupportedOperation(_)
            | LinkError::ReservedPropertyName(_)
            | LinkError::NonAsciiProperty(_)
            | LinkError::InvalidTransition { .. }
            | LinkError::ListenerBusy
            | LinkError::DuplicateIdentity(_)
            | LinkError::UnknownIdentity(_)
            | LinkError::SessionClosed
            | LinkError::NotConnected => ErrorKind::Fatal,
        }
    }

    /// Shorthand for [`ErrorKind::is_retryable`] on this error's kind.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
