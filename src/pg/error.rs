//! Failures of a single protocol stream, on either the client or the backend
//! side of the relay.

use std::fmt;
use std::io;

pub type PgResult<T> = Result<T, PgError>;

#[derive(Debug)]
pub enum PgError {
    /// The socket failed underneath the codec.
    Io(io::Error),

    /// The peer sent bytes that don't form a valid message, or a message that
    /// isn't allowed at this point of the exchange.
    Protocol(String),

    /// The backend refused our credentials or asked for an unsupported
    /// authentication method.
    Auth(String),

    /// `ErrorResponse` from the backend during startup.
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// The DSN could not be parsed.
    Config(String),

    /// Announced frame length, over the accepted maximum.
    MessageTooLarge(usize),

    ConnectionClosed,

    /// Dialing the backend did not finish within the connect timeout.
    Timeout,
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "socket error: {}", e),
            PgError::Protocol(msg) => write!(f, "malformed or unexpected message: {}", msg),
            PgError::Auth(msg) => write!(f, "backend authentication failed: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } => {
                write!(f, "backend {} [{}]: {}", severity, code, message)?;
                if let Some(detail) = detail {
                    write!(f, " (detail: {})", detail)?;
                }
                if let Some(hint) = hint {
                    write!(f, " (hint: {})", hint)?;
                }
                Ok(())
            }
            PgError::Config(msg) => write!(f, "bad backend DSN: {}", msg),
            PgError::MessageTooLarge(len) => {
                write!(f, "frame of {} bytes is over the size limit", len)
            }
            PgError::ConnectionClosed => write!(f, "peer closed the connection"),
            PgError::Timeout => write!(f, "backend connect timed out"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let PgError::Io(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}
