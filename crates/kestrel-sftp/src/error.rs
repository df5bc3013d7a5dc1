//! Error types for SFTP client operations
//!
//! One crate-wide error enum covering caller mistakes (detected before any
//! network I/O), server statuses, protocol violations, and session
//! lifecycle failures. All variants are cloneable so a latched error can be
//! returned from every subsequent call on a failed pipeline.

use thiserror::Error;

use crate::protocol::StatusCode;

/// Result type alias for SFTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// SFTP client error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Caller supplied invalid input; raised before any network I/O
    #[error("Invalid argument '{param}': {message}")]
    Argument {
        param: &'static str,
        message: String,
    },

    /// Operation invoked after dispose
    #[error("The object has already been disposed")]
    Disposed,

    /// No underlying session, or the session has terminated
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Server reported NO_SUCH_FILE
    #[error("{0}")]
    PathNotFound(String),

    /// Server reported PERMISSION_DENIED
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other server status
    #[error("SFTP error (status {code}): {message}")]
    Sftp { code: u32, message: String },

    /// Framing violation, unknown message type, or a response id with no
    /// pending request
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Operation exceeded the configured timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Caller's cancellation signal fired
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Extension not advertised by the server, or the operation requires a
    /// higher protocol version than negotiated
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Local stream-level I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create an argument error for the named parameter.
    pub fn argument(param: &'static str, message: impl Into<String>) -> Self {
        Error::Argument {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Map a server status code to an error of the appropriate kind.
    ///
    /// `message` is the server's error message (empty means "use the
    /// default for the code"); `path` is the client's requested path when
    /// one is available, appended to NO_SUCH_FILE messages.
    pub fn from_status(code: u32, message: &str, path: Option<&str>) -> Self {
        let message = if message.is_empty() {
            StatusCode::default_message(code)
        } else {
            message.to_string()
        };

        match code {
            c if c == StatusCode::NoSuchFile as u32 => {
                let message = match path {
                    Some(path) if !message.ends_with('.') => {
                        format!("{} Path: '{}'.", message, path)
                    }
                    _ => message,
                };
                Error::PathNotFound(message)
            }
            c if c == StatusCode::PermissionDenied as u32 => Error::PermissionDenied(message),
            _ => Error::Sftp { code, message },
        }
    }

    /// Check if the operation can be retried against a fresh session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionClosed(_))
    }

    /// Check if the error was caused by invalid caller input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Argument { .. } | Error::Disposed | Error::Unsupported(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
