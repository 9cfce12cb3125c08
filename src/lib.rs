//! pgrelay - a PostgreSQL transaction pooler.
//!
//! Many client sessions share a small pool of backend connections. A client
//! holds a backend only for the duration of a transaction: as soon as the
//! backend reports an idle `ReadyForQuery`, the connection returns to the pool
//! for the next client.
//!
//! - [`pool`]: bounded backend connection pool with FIFO waiters and eviction
//! - [`proxy`]: per-client relay that decides when a backend is released
//! - [`server`]: TCP listener and client startup handshake
//! - [`pg`]: the wire protocol pieces both sides need

pub mod config;
pub mod error;
pub mod pg;
pub mod pool;
pub mod proxy;
pub mod server;

pub use config::{PoolSettings, ProxyConfig};
pub use error::{PoolerError, Result};
pub use pool::{BackendConnection, Dialer, PgDialer, Pool, PoolConfig, PoolStats};
pub use proxy::Session;
pub use server::Server;
