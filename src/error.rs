//! Error types for the PostgreSQL wire client.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for client operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while talking to a PostgreSQL server.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection (zero-byte read).
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Connect did not complete within the configured timeout.
    #[error("connect timed out")]
    Timeout,

    /// The byte stream did not match the protocol (truncated message,
    /// unexpected tag, invalid UTF-8, ...). Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication was rejected; carries the server's message text.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server reported an error for a request (e.g. bad SQL). The
    /// connection itself remains usable.
    #[error("server error: {0}")]
    Server(String),

    /// A coalesced fetch failed; every caller attached to it observes the
    /// same underlying failure.
    #[error("{0}")]
    Shared(Arc<PgError>),
}

impl PgError {
    /// Whether the connection that produced this error is still structurally
    /// valid and may go back to the pool. Transport and protocol errors leave
    /// the socket in an unknown state; server errors do not.
    pub fn connection_reusable(&self) -> bool {
        match self {
            PgError::Server(_) => true,
            PgError::Shared(inner) => inner.connection_reusable(),
            _ => false,
        }
    }
}
