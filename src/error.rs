//! Error types for wsrelay.
//!
//! Error handling follows two rules:
//!
//! - Protocol failures on a single connection are *values* (see
//!   [`Decoded::Invalid`](crate::net::websocket::Decoded::Invalid)); they never
//!   surface as [`Error`] and never leave the connection's task chain.
//! - [`Error`] is reserved for failures that stop a whole process: binding the
//!   public listener, binding the connector, forking a worker, or the readiness
//!   poller itself failing.
//!
//! # Error Kinds
//!
//! | Kind | Raised by | Fatal |
//! |------|-----------|-------|
//! | `Bind` | public listener bind | yes |
//! | `Connector` | connector socket bind/chmod | yes |
//! | `Fork` | worker fork or link creation | yes |
//! | `Poll` | readiness poller create/wait | yes |
//! | `Config` | invalid configuration | yes |
//! | `Io` | anything else surfaced by a role loop | no |

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The public listening socket could not be bound.
    Bind,
    /// The out-of-band connector socket could not be set up.
    Connector,
    /// A worker process could not be forked or wired to the master.
    Fork,
    /// The readiness poller failed.
    Poll,
    /// Configuration was rejected.
    Config,
    /// Other I/O failure.
    Io,
}

impl ErrorKind {
    /// Returns true if this kind aborts startup or the event loop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Io)
    }

    /// Returns true if this kind can only happen during process bootstrap.
    #[must_use]
    pub const fn is_bootstrap(&self) -> bool {
        matches!(self, Self::Bind | Self::Connector | Self::Fork | Self::Config)
    }
}

/// The main error type for wsrelay operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error aborts the process role.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Bind failure for `addr`.
    #[must_use]
    pub fn bind(addr: impl fmt::Display, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Bind)
            .with_message(format!("failed to bind {addr}"))
            .with_source(source)
    }

    /// Fork failure for worker number `index`.
    #[must_use]
    pub fn fork(index: usize, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Fork)
            .with_message(format!("failed to fork worker {index}"))
            .with_source(source)
    }

    /// Poller failure.
    #[must_use]
    pub fn poll(source: std::io::Error) -> Self {
        Self::new(ErrorKind::Poll)
            .with_message("readiness poller failed")
            .with_source(source)
    }

    /// Configuration rejected.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io).with_source(err)
    }
}

/// A specialized Result type for wsrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn test_bind_and_fork_are_distinct_kinds() {
        let bind = Error::bind("0.0.0.0:2083", io::Error::from(io::ErrorKind::AddrInUse));
        let fork = Error::fork(2, io::Error::from_raw_os_error(libc::EAGAIN));

        assert_eq!(bind.kind(), ErrorKind::Bind);
        assert_eq!(fork.kind(), ErrorKind::Fork);
        assert_ne!(bind.kind(), fork.kind());
        assert!(bind.is_fatal());
        assert!(fork.is_fatal());
        assert!(bind.kind().is_bootstrap());
        assert!(!ErrorKind::Poll.is_bootstrap());
    }

    #[test]
    fn test_display_includes_message_and_source() {
        let err = Error::bind("127.0.0.1:1", io::Error::new(io::ErrorKind::Other, "boom"));
        let text = err.to_string();
        assert!(text.starts_with("Bind: failed to bind 127.0.0.1:1"), "{text}");
        assert!(text.contains("boom"), "{text}");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_io_conversion_is_not_fatal() {
        let err: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!err.is_fatal());
        assert!(err.message().is_none());
    }
}
