//! TCP front end: accepts clients, runs their startup exchange and hands each
//! one to a pooled [`Session`].

mod handshake;

pub use handshake::{handshake, Handshake};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::pg::MessageStream;
use crate::pool::{Dialer, PgDialer, Pool};
use crate::proxy::Session;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Reported to clients when no version is configured.
pub const DEFAULT_SERVER_VERSION: &str = "16.0";

pub struct Server<D: Dialer> {
    listener: TcpListener,
    pool: Pool<D>,
    server_version: Arc<str>,
    next_pid: AtomicI32,
}

impl Server<PgDialer> {
    /// Bind the listen address and build the backend pool from `config`.
    pub async fn bind(config: &ProxyConfig) -> Result<Self> {
        let pool = Pool::connect(config.pool_config())?;
        let listener = TcpListener::bind(&config.listen_address).await?;
        Ok(Self::new(listener, pool).with_server_version(&config.server_version))
    }
}

impl<D: Dialer> Server<D> {
    pub fn new(listener: TcpListener, pool: Pool<D>) -> Self {
        Self {
            listener,
            pool,
            server_version: Arc::from(DEFAULT_SERVER_VERSION),
            next_pid: AtomicI32::new(1),
        }
    }

    /// Override the `server_version` announced during startup.
    pub fn with_server_version(mut self, version: &str) -> Self {
        self.server_version = Arc::from(version);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn pool(&self) -> &Pool<D> {
        &self.pool
    }

    /// Accept clients until `shutdown` resolves, then abort every live
    /// session and close the pool.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(address = %self.local_addr()?, "accepting client connections");

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept client connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
                    let span = info_span!("session", pid, %peer);
                    sessions.spawn(
                        serve_client(socket, pid, self.pool.clone(), Arc::clone(&self.server_version))
                            .instrument(span),
                    );
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            warn!(error = %e, "session task panicked");
                        }
                    }
                }
            }
        }

        info!(sessions = sessions.len(), "shutting down");
        sessions.shutdown().await;
        self.pool.close().await
    }
}

async fn serve_client<D: Dialer>(
    socket: TcpStream,
    pid: i32,
    pool: Pool<D>,
    server_version: Arc<str>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    let mut stream = MessageStream::new(socket);

    match handshake(&mut stream, pid, &server_version).await {
        Ok(Handshake::Ready { user, database }) => {
            info!(user = %user, database = database.as_deref().unwrap_or(""), "client connected");
        }
        Ok(Handshake::Cancel { process_id }) => {
            debug!(target_pid = process_id, "ignoring cancel request");
            return;
        }
        Err(e) => {
            warn!(error = %e, "client handshake failed");
            return;
        }
    }

    match Session::new(stream, pool).run().await {
        Ok(()) => info!("client disconnected"),
        Err(e) => warn!(error = %e, "session ended with error"),
    }
}
