//! How the pool reaches the database.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::pg::{PgConfig, PgConnection, PgResult};

/// Opens new backend connections for a pool.
///
/// The pool calls `dial` without holding its lock, possibly from several
/// tasks at once.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Establish one ready-for-query backend connection.
    fn dial(&self) -> impl Future<Output = PgResult<PgConnection<Self::Stream>>> + Send;
}

/// Dials a PostgreSQL server over TCP and logs in.
#[derive(Debug, Clone)]
pub struct PgDialer {
    config: PgConfig,
}

impl PgDialer {
    pub fn new(config: PgConfig) -> Self {
        Self { config }
    }

    pub fn from_url(url: &str) -> PgResult<Self> {
        Ok(Self::new(PgConfig::from_url(url)?))
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

impl Dialer for PgDialer {
    type Stream = TcpStream;

    fn dial(&self) -> impl Future<Output = PgResult<PgConnection<TcpStream>>> + Send {
        PgConnection::connect_with_config(&self.config)
    }
}
