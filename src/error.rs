//! Error types for the pooler.

use std::time::Duration;

use thiserror::Error;

use crate::pg::PgError;

#[derive(Error, Debug)]
pub enum PoolerError {
    /// The pool has been shut down. Terminal, never retried.
    #[error("pool is closed")]
    PoolClosed,

    /// An idle connection outlived its lifetime. Consumed by `Pool::acquire`,
    /// which retries with a fresh dial; callers never observe it.
    #[error("connection expired")]
    ConnExpired,

    #[error("timed out after {0:?} waiting for a backend connection")]
    AcquireTimeout(Duration),

    /// Opening (or closing) a backend connection failed.
    #[error("Backend connection error: {0}")]
    ConnectionError(#[source] PgError),

    /// A session's relay failed at the named stage.
    #[error("error while {stage}: {source}")]
    RelayError {
        stage: &'static str,
        #[source]
        source: PgError,
    },

    /// The client violated the startup protocol.
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] PgError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PoolerError {
    /// Attach a relay stage to a protocol-layer error.
    pub(crate) fn relay(stage: &'static str) -> impl FnOnce(PgError) -> Self {
        move |source| PoolerError::RelayError { stage, source }
    }

    /// SQLSTATE reported to a client whose session ends with this error.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            PoolerError::PoolClosed | PoolerError::AcquireTimeout(_) => "53300",
            PoolerError::ConnectionError(_) => "08006",
            PoolerError::ProtocolError(_) | PoolerError::RelayError { .. } => "08P01",
            _ => "XX000",
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolerError>;
