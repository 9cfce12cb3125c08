//! PostgreSQL wire protocol, as much of it as a pooling proxy needs.
//!
//! The proxy speaks the protocol on two sides: it terminates client
//! connections, and it logs into the real server on behalf of the pool.
//! Traffic in between is relayed as opaque frames; only the messages that
//! drive pooling decisions are decoded.
//!
//! Architecture:
//! - `protocol`: Frames, frontend message encoders, backend message codec
//! - `stream`: Buffered framing over any async byte stream
//! - `connection`: Backend login and session state
//! - `scram`: SCRAM-SHA-256 client exchange

pub mod connection;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod stream;

#[cfg(test)]
mod tests;

pub use connection::{PgConfig, PgConnection};
pub use error::{PgError, PgResult};
pub use protocol::{BackendMessage, Frame, FrontendKind, TransactionStatus};
pub use stream::MessageStream;
