//! Pool limits.

use std::time::Duration;

/// Idle connections kept when `max_idle` is left at zero.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// Connection pool configuration.
///
/// Numeric limits follow the usual conventions: `max_idle == 0` selects
/// [`DEFAULT_MAX_IDLE_CONNS`], a negative `max_idle` disables idle retention,
/// `max_open <= 0` means unlimited, and a `None` or zero duration disables
/// the corresponding eviction.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Backend connection string
    pub dsn: String,
    /// Maximum idle connections retained
    pub max_idle: i32,
    /// Maximum open connections (idle + leased + being dialed)
    pub max_open: i32,
    /// Maximum age of a connection before it is retired
    pub max_lifetime: Option<Duration>,
    /// Maximum time a connection may sit idle before it is closed
    pub max_idle_time: Option<Duration>,
    /// Maximum time `acquire` waits for capacity; `None` waits indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Create a new pool configuration with no limits beyond the idle default.
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            max_idle: 0,
            max_open: 0,
            max_lifetime: None,
            max_idle_time: None,
            acquire_timeout: None,
        }
    }

    pub fn max_idle(mut self, max: i32) -> Self {
        self.max_idle = max;
        self
    }

    pub fn max_open(mut self, max: i32) -> Self {
        self.max_open = max;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = Some(idle);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Effective idle list capacity.
    pub fn idle_capacity(&self) -> usize {
        match self.max_idle {
            0 => DEFAULT_MAX_IDLE_CONNS,
            n if n < 0 => 0,
            n => n as usize,
        }
    }

    /// Effective open-connection limit, `None` when unlimited.
    pub fn open_limit(&self) -> Option<usize> {
        (self.max_open > 0).then_some(self.max_open as usize)
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.max_lifetime.filter(|d| !d.is_zero())
    }

    pub fn idle_time(&self) -> Option<Duration> {
        self.max_idle_time.filter(|d| !d.is_zero())
    }

    /// The shorter of the two eviction thresholds, if any is set.
    pub fn shortest_eviction(&self) -> Option<Duration> {
        match (self.idle_time(), self.lifetime()) {
            (Some(idle), Some(life)) => Some(idle.min(life)),
            (idle, life) => idle.or(life),
        }
    }
}
