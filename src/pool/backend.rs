//! The record the pool keeps for every backend connection it opened.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::pg::{PgConnection, PgResult};

/// A backend connection plus the lifecycle data the pool needs.
///
/// `in_use` and `returned_at` are only ever changed by the pool, under its
/// lock. A record is either leased to exactly one caller, sitting in the idle
/// list, or being closed.
pub struct BackendConnection<S> {
    id: u64,
    conn: PgConnection<S>,
    created_at: Instant,
    pub(super) returned_at: Instant,
    pub(super) in_use: bool,
}

impl<S> BackendConnection<S> {
    pub(super) fn new(id: u64, conn: PgConnection<S>, in_use: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            returned_at: now,
            in_use,
        }
    }

    /// Pool-unique identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn returned_at(&self) -> Instant {
        self.returned_at
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Whether the connection has reached `max_lifetime`.
    pub fn expired(&self, max_lifetime: Option<Duration>) -> bool {
        match max_lifetime {
            Some(limit) if !limit.is_zero() => self.created_at.elapsed() >= limit,
            _ => false,
        }
    }

    pub(super) fn into_connection(self) -> PgConnection<S> {
        self.conn
    }

    /// The underlying session, for relaying.
    pub fn connection_mut(&mut self) -> &mut PgConnection<S> {
        &mut self.conn
    }
}

impl<S: AsyncRead + AsyncWrite> BackendConnection<S> {
    /// Physically close the connection. Pool bookkeeping is the caller's job.
    pub async fn close(&mut self) -> PgResult<()> {
        self.conn.close().await
    }
}

impl<S> fmt::Debug for BackendConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("in_use", &self.in_use)
            .field("created_at", &self.created_at)
            .field("returned_at", &self.returned_at)
            .finish()
    }
}
