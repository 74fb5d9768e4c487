//! Error types for the PostgreSQL protocol implementation.

use std::io;

use thiserror::Error;

use super::protocol::ErrorFields;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Error type a caller-supplied handler may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Return type of success handlers. An `Err` is redirected to the
/// operation's error handler.
pub type HandlerResult = Result<(), BoxError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an error.
    #[error("{}", display_server(.severity, .code, .message, .detail, .hint))]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// A column value could not be converted to the requested type.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Another query or transaction step is still running on this connection.
    #[error("Operation already in progress")]
    OperationInProgress,

    /// More parameters than a Bind message can carry.
    #[error("Too many parameters: {0} (at most 65535)")]
    TooManyParameters(usize),

    /// Connection is closed or in invalid state.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Timeout waiting for response.
    #[error("Operation timed out")]
    Timeout,

    /// A success handler returned an error or panicked.
    #[error("Handler failed: {0}")]
    Handler(BoxError),
}

impl PgError {
    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Protocol(_) | PgError::Auth(_) | PgError::ConnectionClosed
        )
    }

    /// SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        PgError::Protocol(msg.into())
    }

    pub(crate) fn conversion(msg: impl Into<String>) -> Self {
        PgError::Conversion(msg.into())
    }
}

impl From<&ErrorFields> for PgError {
    fn from(fields: &ErrorFields) -> Self {
        PgError::Server {
            severity: fields.severity().unwrap_or_default().to_string(),
            code: fields.code().unwrap_or_default().to_string(),
            message: fields.message().unwrap_or_default().to_string(),
            detail: fields.get(b'D').map(str::to_string),
            hint: fields.get(b'H').map(str::to_string),
        }
    }
}

fn display_server(
    severity: &str,
    code: &str,
    message: &str,
    detail: &Option<String>,
    hint: &Option<String>,
) -> String {
    let mut out = format!("{}: {} ({})", severity, message, code);
    if let Some(d) = detail {
        out.push_str("\nDetail: ");
        out.push_str(d);
    }
    if let Some(h) = hint {
        out.push_str("\nHint: ");
        out.push_str(h);
    }
    out
}
