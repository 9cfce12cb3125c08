//! Backend connection pool.
//!
//! One lock guards all pool state. Dialing and physical closes always happen
//! outside it. Capacity that frees up while requests are queued is refilled by
//! a background opener task, and idle connections are aged out by a cleaner
//! task that only runs while there is something to clean.

mod backend;
mod cleaner;
mod config;
mod dialer;


pub use backend::BackendConnection;
pub use config::{PoolConfig, DEFAULT_MAX_IDLE_CONNS};
pub use dialer::{Dialer, PgDialer};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PoolerError, Result};
use crate::pg::PgResult;

/// What a queued request is eventually handed: a leased connection, or the
/// error from the dial made on its behalf.
type ConnRequest<S> = PgResult<BackendConnection<S>>;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Configured open limit, 0 when unlimited
    pub max_open: usize,
    /// Connections open or being dialed
    pub open: usize,
    /// Connections currently leased (or being dialed)
    pub in_use: usize,
    /// Connections in the idle list
    pub idle: usize,
    /// Requests currently queued for capacity
    pub waiting: usize,
    /// Total requests that had to queue
    pub wait_count: u64,
    /// Total time spent queued
    pub wait_duration: Duration,
    /// Connections closed because the idle list was full
    pub max_idle_closed: u64,
    /// Connections closed by idle-time eviction
    pub max_idle_time_closed: u64,
    /// Connections closed by lifetime eviction
    pub max_lifetime_closed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReuseStrategy {
    /// Always dial (or wait for) a fresh connection
    AlwaysNew,
    /// Prefer the most recently returned idle connection
    CachedOrNew,
}

struct PoolState<S> {
    /// Idle connections, oldest return first
    free: Vec<BackendConnection<S>>,
    /// Queued requests keyed by arrival order
    requests: BTreeMap<u64, oneshot::Sender<ConnRequest<S>>>,
    next_request: u64,
    next_conn_id: u64,
    /// Idle + leased + being dialed
    num_open: usize,
    closed: bool,
    /// Held while a cleaner runs; dropping it stops the cleaner
    cleaner: Option<mpsc::Sender<()>>,
    wait_count: u64,
    max_idle_closed: u64,
    max_idle_time_closed: u64,
    max_lifetime_closed: u64,
}

impl<S> PoolState<S> {
    fn new() -> Self {
        Self {
            free: Vec::new(),
            requests: BTreeMap::new(),
            next_request: 0,
            next_conn_id: 0,
            num_open: 0,
            closed: false,
            cleaner: None,
            wait_count: 0,
            max_idle_closed: 0,
            max_idle_time_closed: 0,
            max_lifetime_closed: 0,
        }
    }

    fn next_conn_id(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    fn next_request_key(&mut self) -> u64 {
        let key = self.next_request;
        self.next_request += 1;
        key
    }
}

struct PoolInner<D: Dialer> {
    config: PoolConfig,
    dialer: D,
    state: Mutex<PoolState<D::Stream>>,
    /// One token per connection the opener should dial
    opener: mpsc::UnboundedSender<()>,
    shutdown: watch::Sender<bool>,
    wait_duration_nanos: AtomicU64,
}

/// A pool of backend connections shared by every client session.
///
/// Cloning is cheap; all clones share the same state.
pub struct Pool<D: Dialer> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Dialer> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pool<PgDialer> {
    /// Build a pool that dials `config.dsn` over TCP.
    pub fn connect(config: PoolConfig) -> Result<Self> {
        let dialer = PgDialer::from_url(&config.dsn).map_err(|e| {
            PoolerError::ConfigError(format!("invalid dsn {:?}: {}", config.dsn, e))
        })?;
        Ok(Self::new(config, dialer))
    }
}

impl<D: Dialer> Pool<D> {
    /// Create a pool and start its opener task.
    ///
    /// No connection is dialed up front. Must be called within a tokio runtime.
    pub fn new(config: PoolConfig, dialer: D) -> Self {
        let (opener, tokens) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(PoolInner {
            config,
            dialer,
            state: Mutex::new(PoolState::new()),
            opener,
            shutdown,
            wait_duration_nanos: AtomicU64::new(0),
        });

        tokio::spawn(run_opener(Arc::downgrade(&inner), tokens, shutdown_rx));

        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection, retrying once with a fresh dial when the cached
    /// connection turns out to be expired.
    pub async fn acquire(&self) -> Result<BackendConnection<D::Stream>> {
        match self.conn(ReuseStrategy::CachedOrNew).await {
            Err(PoolerError::ConnExpired) => self.conn(ReuseStrategy::AlwaysNew).await,
            other => other,
        }
    }

    /// Return a leased connection.
    ///
    /// # Panics
    ///
    /// Panics if `conn` is not currently leased.
    pub fn release(&self, conn: BackendConnection<D::Stream>) {
        self.inner.release(conn);
    }

    /// Drop a leased connection whose session state can't be trusted, freeing
    /// its capacity.
    ///
    /// # Panics
    ///
    /// Panics if `conn` is not currently leased.
    pub fn discard(&self, conn: BackendConnection<D::Stream>) {
        self.inner.discard(conn);
    }

    /// Shut the pool down.
    ///
    /// Closes every idle connection, fails all queued requests with
    /// [`PoolerError::PoolClosed`] and stops the background tasks. Leased
    /// connections are closed as they are returned. Idempotent; the error
    /// reported is the last one seen while closing idle connections.
    pub async fn close(&self) -> Result<()> {
        let (idle, cleaner, waiting) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.free);
            state.num_open -= idle.len();
            let waiting = std::mem::take(&mut state.requests);
            (idle, state.cleaner.take(), waiting)
        };

        info!(
            idle = idle.len(),
            waiting = waiting.len(),
            "closing connection pool"
        );

        // Dropping the senders wakes every queued request with PoolClosed.
        drop(waiting);
        drop(cleaner);

        let mut result = Ok(());
        for mut conn in idle {
            if let Err(e) = conn.close().await {
                warn!(conn = conn.id(), error = %e, "error closing idle connection");
                result = Err(PoolerError::ConnectionError(e));
            }
        }

        // The opener may already be gone if every handle was dropped.
        let _ = self.inner.shutdown.send(true);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let wait_duration =
            Duration::from_nanos(self.inner.wait_duration_nanos.load(Ordering::Relaxed));
        let state = self.inner.state.lock();
        PoolStats {
            max_open: self.inner.config.open_limit().unwrap_or(0),
            open: state.num_open,
            in_use: state.num_open - state.free.len(),
            idle: state.free.len(),
            waiting: state.requests.len(),
            wait_count: state.wait_count,
            wait_duration,
            max_idle_closed: state.max_idle_closed,
            max_idle_time_closed: state.max_idle_time_closed,
            max_lifetime_closed: state.max_lifetime_closed,
        }
    }

    async fn conn(&self, strategy: ReuseStrategy) -> Result<BackendConnection<D::Stream>> {
        enum Plan<S> {
            Reuse(BackendConnection<S>),
            Expired(BackendConnection<S>),
            Wait(u64, oneshot::Receiver<ConnRequest<S>>),
            Dial(u64),
        }

        let lifetime = self.inner.config.lifetime();

        let plan = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolerError::PoolClosed);
            }

            let cached = match strategy {
                ReuseStrategy::CachedOrNew => state.free.pop(),
                ReuseStrategy::AlwaysNew => None,
            };

            if let Some(mut conn) = cached {
                conn.in_use = true;
                if conn.expired(lifetime) {
                    state.max_lifetime_closed += 1;
                    state.num_open -= 1;
                    self.inner.maybe_open_new_connections(&mut state);
                    Plan::Expired(conn)
                } else {
                    Plan::Reuse(conn)
                }
            } else if self
                .inner
                .config
                .open_limit()
                .is_some_and(|max| state.num_open >= max)
            {
                let (tx, rx) = oneshot::channel();
                let key = state.next_request_key();
                state.requests.insert(key, tx);
                state.wait_count += 1;
                Plan::Wait(key, rx)
            } else {
                // Count the connection before dialing so concurrent callers
                // can't overshoot the limit.
                state.num_open += 1;
                Plan::Dial(state.next_conn_id())
            }
        };

        match plan {
            Plan::Reuse(conn) => {
                debug!(conn = conn.id(), "reusing idle connection");
                Ok(conn)
            }
            Plan::Expired(conn) => {
                debug!(conn = conn.id(), "idle connection exceeded its lifetime");
                close_in_background(vec![conn]);
                Err(PoolerError::ConnExpired)
            }
            Plan::Wait(key, rx) => self.wait_for_conn(key, rx, strategy).await,
            Plan::Dial(id) => {
                let reservation = Reservation {
                    pool: &self.inner,
                    kept: false,
                };
                match self.inner.dialer.dial().await {
                    Ok(conn) => {
                        reservation.keep();
                        debug!(conn = id, "opened backend connection");
                        Ok(BackendConnection::new(id, conn, true))
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to open backend connection");
                        drop(reservation);
                        Err(PoolerError::ConnectionError(e))
                    }
                }
            }
        }
    }

    async fn wait_for_conn(
        &self,
        key: u64,
        rx: oneshot::Receiver<ConnRequest<D::Stream>>,
        strategy: ReuseStrategy,
    ) -> Result<BackendConnection<D::Stream>> {
        let mut waiter = Waiter {
            pool: Arc::clone(&self.inner),
            key,
            rx,
            settled: false,
        };

        let started = Instant::now();
        let delivered = match self.inner.config.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiter.recv()).await {
                Ok(delivered) => delivered,
                Err(_) => {
                    self.record_wait(started);
                    debug!(timeout = ?limit, "timed out waiting for a backend connection");
                    return Err(PoolerError::AcquireTimeout(limit));
                }
            },
            None => waiter.recv().await,
        };
        self.record_wait(started);

        let conn = match delivered {
            None => return Err(PoolerError::PoolClosed),
            Some(Err(e)) => return Err(PoolerError::ConnectionError(e)),
            Some(Ok(conn)) => conn,
        };

        if strategy == ReuseStrategy::CachedOrNew && conn.expired(self.inner.config.lifetime()) {
            {
                let mut state = self.inner.state.lock();
                state.max_lifetime_closed += 1;
                state.num_open -= 1;
                self.inner.maybe_open_new_connections(&mut state);
            }
            close_in_background(vec![conn]);
            return Err(PoolerError::ConnExpired);
        }

        Ok(conn)
    }

    fn record_wait(&self, started: Instant) {
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.inner
            .wait_duration_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }
}

impl<D: Dialer> PoolInner<D> {
    fn release(self: &Arc<Self>, conn: BackendConnection<D::Stream>) {
        assert!(
            conn.in_use,
            "connection {} released while not leased",
            conn.id()
        );

        let expired = conn.expired(self.config.lifetime());

        let closing = {
            let mut state = self.state.lock();
            let rejected = if expired {
                state.max_lifetime_closed += 1;
                Some(conn)
            } else {
                self.put_conn_locked(&mut state, Ok(conn))
            };
            if rejected.is_some() {
                state.num_open -= 1;
                self.maybe_open_new_connections(&mut state);
            }
            rejected
        };

        if let Some(conn) = closing {
            debug!(conn = conn.id(), expired, "closing released connection");
            close_in_background(vec![conn]);
        }
    }

    fn discard(self: &Arc<Self>, conn: BackendConnection<D::Stream>) {
        assert!(
            conn.in_use,
            "connection {} discarded while not leased",
            conn.id()
        );

        {
            let mut state = self.state.lock();
            state.num_open -= 1;
            self.maybe_open_new_connections(&mut state);
        }

        debug!(conn = conn.id(), "discarding backend connection");
        close_in_background(vec![conn]);
    }

    /// Hand a connection (or a dial error) to the oldest queued request, or
    /// park the connection in the idle list.
    ///
    /// Returns the connection when neither could take it; the caller closes it
    /// and owns the `num_open` decrement.
    fn put_conn_locked(
        self: &Arc<Self>,
        state: &mut PoolState<D::Stream>,
        mut value: ConnRequest<D::Stream>,
    ) -> Option<BackendConnection<D::Stream>> {
        if state.closed {
            return value.ok();
        }
        if self
            .config
            .open_limit()
            .is_some_and(|max| state.num_open > max)
        {
            return value.ok();
        }

        while let Some((_, request)) = state.requests.pop_first() {
            if let Ok(conn) = &mut value {
                conn.in_use = true;
            }
            match request.send(value) {
                Ok(()) => return None,
                // The requester went away between dequeue and delivery.
                Err(returned) => value = returned,
            }
        }

        let mut conn = match value {
            Ok(conn) => conn,
            Err(_) => return None,
        };
        conn.in_use = false;

        if state.free.len() < self.config.idle_capacity() {
            // Stamped under the lock so `free` stays ordered by return time.
            conn.returned_at = Instant::now();
            state.free.push(conn);
            self.start_cleaner_locked(state);
            return None;
        }

        state.max_idle_closed += 1;
        Some(conn)
    }

    /// Queue one dial per outstanding request, within the open limit.
    fn maybe_open_new_connections(&self, state: &mut PoolState<D::Stream>) {
        let mut wanted = state.requests.len();
        if let Some(max) = self.config.open_limit() {
            wanted = wanted.min(max.saturating_sub(state.num_open));
        }

        for _ in 0..wanted {
            if state.closed {
                return;
            }
            state.num_open += 1;
            if self.opener.send(()).is_err() {
                state.num_open -= 1;
                return;
            }
        }
    }

    /// Dial one connection on behalf of the queued requests.
    async fn open_new_connection(self: &Arc<Self>) {
        let dialed = self.dialer.dial().await;

        let closing = {
            let mut state = self.state.lock();
            if state.closed {
                state.num_open -= 1;
                dialed.ok()
            } else {
                match dialed {
                    Err(e) => {
                        warn!(error = %e, "background dial failed");
                        state.num_open -= 1;
                        self.put_conn_locked(&mut state, Err(e));
                        self.maybe_open_new_connections(&mut state);
                        None
                    }
                    Ok(conn) => {
                        let id = state.next_conn_id();
                        debug!(conn = id, "opened backend connection for queued request");
                        let conn = BackendConnection::new(id, conn, false);
                        let rejected = self.put_conn_locked(&mut state, Ok(conn));
                        if rejected.is_some() {
                            state.num_open -= 1;
                        }
                        rejected.map(BackendConnection::into_connection)
                    }
                }
            }
        };

        if let Some(mut conn) = closing {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "error closing surplus connection");
            }
        }
    }
}

/// An open slot counted in `num_open` while its dial is in flight. Unless
/// kept, dropping it gives the slot back, including when the `acquire` future
/// is dropped mid-dial.
struct Reservation<'a, D: Dialer> {
    pool: &'a Arc<PoolInner<D>>,
    kept: bool,
}

impl<D: Dialer> Reservation<'_, D> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl<D: Dialer> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        let mut state = self.pool.state.lock();
        state.num_open -= 1;
        self.pool.maybe_open_new_connections(&mut state);
    }
}

/// A queued `acquire`. Dropping it before delivery withdraws the request, and
/// hands back a connection that was delivered after the caller stopped
/// listening.
struct Waiter<D: Dialer> {
    pool: Arc<PoolInner<D>>,
    key: u64,
    rx: oneshot::Receiver<ConnRequest<D::Stream>>,
    settled: bool,
}

impl<D: Dialer> Waiter<D> {
    /// `None` when the pool closed before serving the request.
    async fn recv(&mut self) -> Option<ConnRequest<D::Stream>> {
        let delivered = (&mut self.rx).await.ok();
        self.settled = true;
        delivered
    }
}

impl<D: Dialer> Drop for Waiter<D> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.pool.state.lock().requests.remove(&self.key).is_some() {
            return;
        }
        if let Ok(Ok(conn)) = self.rx.try_recv() {
            debug!(conn = conn.id(), "returning connection delivered to an abandoned request");
            self.pool.release(conn);
        }
    }
}

async fn run_opener<D: Dialer>(
    pool: Weak<PoolInner<D>>,
    mut tokens: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Tokens never dialed still hold a slot in `num_open`.
                if let Some(pool) = pool.upgrade() {
                    let mut state = pool.state.lock();
                    while tokens.try_recv().is_ok() {
                        state.num_open -= 1;
                    }
                }
                return;
            }
            token = tokens.recv() => {
                if token.is_none() {
                    return;
                }
                let Some(pool) = pool.upgrade() else { return };
                pool.open_new_connection().await;
            }
        }
    }
}

/// Physically close connections off the caller's path.
fn close_in_background<S>(conns: Vec<BackendConnection<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if conns.is_empty() {
        return;
    }
    // Outside a runtime the sockets are simply dropped.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        for mut conn in conns {
            if let Err(e) = conn.close().await {
                debug!(conn = conn.id(), error = %e, "error closing backend connection");
            }
        }
    });
}
