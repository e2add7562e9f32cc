use std::io;

use thiserror::Error;

/// An error talking to an indexer server.
#[derive(Error, Debug)]
pub enum Error {
    /// An io error on the transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The request was not answered within its deadline.
    #[error("request timed out")]
    Timeout,

    /// The server closed the connection mid-request.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// The server answered with an error object.
    #[error("server error {code}: {message}")]
    Server {
        /// Numeric error code, or zero when the server sent a bare string.
        code: i64,
        /// Human-readable message from the server.
        message: String,
    },

    /// The server's bytes did not parse as a valid response.
    #[error("malformed server response: {0}")]
    Response(String),

    /// The background connection task is gone; the client is unusable.
    #[error("client task has shut down")]
    Shutdown,
}

impl Error {
    /// Whether a synchronizer should retry after this error rather than
    /// surface it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout | Error::ConnectionClosed
        )
    }

    pub(crate) fn malformed(what: &str) -> Error {
        Error::Response(what.to_string())
    }
}
