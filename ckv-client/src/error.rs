//! # Client Errors
//!
//! One error enum for every failure the client can surface. Transport and
//! protocol failures are wrapped in [`ClientError::Command`] together with the
//! call site that issued the command, so a log line points back at the
//! application code rather than at the pool internals.
//!
//! Absent values are not errors: commands that can hit a missing key, field
//! or queue entry return `Ok(None)`.

use std::panic::Location;

use ckv_common::ProtocolError;
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while dialing, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Reply shape did not match what the command returns.
    #[error("unexpected response to {command}")]
    UnexpectedResponse { command: &'static str },
    /// Pool is at capacity and the pool is configured not to wait.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Host/port could not be resolved to a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Connection URL could not be parsed.
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
    /// Configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Another holder owns the named lock.
    #[error("lock {name:?} is already held")]
    AlreadyLocked { name: String },
    /// Readiness gate gave up.
    #[error("store not ready after {attempts} attempts: {source}")]
    NotReady {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },
    /// A command failed; `location` is where the caller issued it.
    #[error("{command} failed at {location}: {source}")]
    Command {
        command: &'static str,
        location: &'static Location<'static>,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Wraps `self` with the command name and originating call site.
    pub(crate) fn traced(self, command: &'static str, location: &'static Location<'static>) -> Self {
        match self {
            // Contention is an expected outcome, keep it matchable.
            err @ ClientError::AlreadyLocked { .. } => err,
            err @ ClientError::Command { .. } => err,
            err => ClientError::Command {
                command,
                location,
                source: Box::new(err),
            },
        }
    }

    /// Strips `Command` context layers.
    pub fn root(&self) -> &ClientError {
        let mut current = self;
        while let ClientError::Command { source, .. } = current {
            current = source;
        }
        current
    }

    /// True when the error is lock contention.
    pub fn is_already_locked(&self) -> bool {
        matches!(self.root(), ClientError::AlreadyLocked { .. })
    }

    /// True for failures that leave the connection unusable.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self.root(), ClientError::Io(_) | ClientError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traced_keeps_caller_location() {
        let location = Location::caller();
        let err = ClientError::PoolExhausted.traced("HGET", location);
        match &err {
            ClientError::Command { command, location: at, .. } => {
                assert_eq!(*command, "HGET");
                assert_eq!(at.file(), file!());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(err.root(), ClientError::PoolExhausted));
        assert!(err.to_string().starts_with("HGET failed at "));
    }

    #[test]
    fn contention_is_not_wrapped() {
        let err = ClientError::AlreadyLocked { name: "job".into() }.traced("SET", Location::caller());
        assert!(matches!(err, ClientError::AlreadyLocked { .. }));
        assert!(err.is_already_locked());
    }

    #[test]
    fn transport_detection_sees_through_context() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = ClientError::from(io).traced("PING", Location::caller());
        assert!(err.is_transport());
        let server = ClientError::Server { message: b"ERR x".to_vec() };
        assert!(!server.is_transport());
    }
}
