use std::error::Error;
use std::fmt;
use std::io;

/// Errors raised by the engine itself while handling a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// A response header or cookie value contained a raw CR or LF.
    InvalidHeader(String),
    /// A custom reason phrase contained a raw CR or LF.
    InvalidReasonPhrase,
    /// The request body was already consumed in streaming mode.
    BodyConsumed,
    /// The server is already running.
    AlreadyStarted,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::InvalidHeader(name) => {
                write!(f, "invalid value for response header `{}`", name)
            }
            HttpError::InvalidReasonPhrase => write!(f, "invalid response reason phrase"),
            HttpError::BodyConsumed => write!(f, "request body was already streamed"),
            HttpError::AlreadyStarted => write!(f, "server already started"),
        }
    }
}

impl Error for HttpError {}

impl From<HttpError> for io::Error {
    fn from(err: HttpError) -> Self {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

/// Whether an I/O error is the peer going away, which is expected while
/// connections are torn down concurrently.
pub(crate) fn is_transport_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Same as [`is_transport_error`], looking through an `http_types::Error`.
pub(crate) fn is_transport_failure(err: &http_types::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map(is_transport_error)
        .unwrap_or(false)
}
