//! Transaction-pooling client sessions.
//!
//! A session holds a backend lease only while the client is inside a
//! transaction. Every query cycle ends at the backend's `ReadyForQuery`; if the
//! reported status is idle the backend goes straight back to the pool,
//! otherwise the session keeps it for the client's next statement.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{PoolerError, Result};
use crate::pg::{
    BackendMessage, Frame, FrontendKind, MessageStream, PgConnection, PgError, TransactionStatus,
};
use crate::pool::{BackendConnection, Dialer, Pool};

/// Backend messages relayed between forced client flushes.
const FLUSH_EVERY: usize = 10;

/// One client connection past the startup handshake.
pub struct Session<C, D: Dialer> {
    client: MessageStream<C>,
    pool: Pool<D>,
    /// Backend held across statements while a transaction is open
    lease: Option<BackendConnection<D::Stream>>,
    /// Status from the most recent `ReadyForQuery`
    tx_status: TransactionStatus,
}

impl<C, D> Session<C, D>
where
    C: AsyncRead + AsyncWrite,
    D: Dialer,
{
    pub fn new(client: MessageStream<C>, pool: Pool<D>) -> Self {
        Self {
            client,
            pool,
            lease: None,
            tx_status: TransactionStatus::Unset,
        }
    }

    pub fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Serve the client until it terminates or the session fails.
    ///
    /// A failure is reported to the client as a FATAL error before returning.
    /// A lease still held at the end is discarded, never pooled.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;

        if let Err(err) = &result {
            let fatal = BackendMessage::fatal(err.sqlstate(), &err.to_string());
            // The client may already be gone.
            if self.client.send(&fatal).await.is_ok() {
                let _ = self.client.flush().await;
            }
        }

        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let frame = match self.client.receive().await {
                Ok(frame) => frame,
                Err(PgError::ConnectionClosed) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(PoolerError::relay("receiving from client")(e)),
            };

            match frame.frontend_kind() {
                FrontendKind::Terminate => {
                    debug!("client terminated session");
                    return Ok(());
                }
                FrontendKind::Query => self.handle_simple_query(frame).await?,
                kind if kind.is_extended_query() => self.handle_extended_query(frame).await?,
                kind => {
                    return Err(PoolerError::RelayError {
                        stage: "dispatching client message",
                        source: PgError::Protocol(format!("unsupported frontend message {:?}", kind)),
                    })
                }
            }
        }
    }

    /// Forward one simple query and relay its response.
    pub async fn handle_simple_query(&mut self, query: Frame) -> Result<()> {
        self.ensure_lease().await?;
        let backend = self.leased()?;

        backend
            .send_frame(&query)
            .await
            .map_err(PoolerError::relay("forwarding query to backend"))?;
        backend
            .flush()
            .await
            .map_err(PoolerError::relay("flushing query to backend"))?;

        self.relay_response().await
    }

    /// Forward an extended-query sequence up to and including `Sync`, flush it
    /// once, and relay the response.
    pub async fn handle_extended_query(&mut self, first: Frame) -> Result<()> {
        self.ensure_lease().await?;

        let mut frame = first;
        loop {
            let kind = frame.frontend_kind();
            if kind == FrontendKind::Terminate {
                return Err(PoolerError::RelayError {
                    stage: "receiving extended query message from client",
                    source: PgError::Protocol("Terminate before Sync".to_string()),
                });
            }

            self.leased()?
                .send_frame(&frame)
                .await
                .map_err(PoolerError::relay("forwarding extended query to backend"))?;

            if kind == FrontendKind::Sync {
                break;
            }

            frame = self
                .client
                .receive()
                .await
                .map_err(PoolerError::relay("receiving extended query message from client"))?;
        }

        self.leased()?
            .flush()
            .await
            .map_err(PoolerError::relay("flushing extended query to backend"))?;

        self.relay_response().await
    }

    /// Relay backend messages to the client through the next `ReadyForQuery`,
    /// then release the lease if the backend is idle.
    async fn relay_response(&mut self) -> Result<()> {
        let mut relayed = 0usize;

        loop {
            let frame = self
                .leased()?
                .receive_frame()
                .await
                .map_err(PoolerError::relay("receiving from backend"))?;
            relayed += 1;

            self.client
                .send_frame(&frame)
                .await
                .map_err(PoolerError::relay("forwarding to client"))?;

            let status = frame
                .ready_for_query_status()
                .map_err(PoolerError::relay("receiving from backend"))?;

            match status {
                Some(status) => {
                    self.client
                        .flush()
                        .await
                        .map_err(PoolerError::relay("flushing to client"))?;
                    self.tx_status = status;

                    if status.is_releasable() {
                        if let Some(conn) = self.lease.take() {
                            debug!(conn = conn.id(), "releasing backend connection");
                            self.pool.release(conn);
                        }
                    } else {
                        debug!(status = ?status, "keeping backend connection for open transaction");
                    }
                    return Ok(());
                }
                None if relayed % FLUSH_EVERY == 0 => {
                    self.client
                        .flush()
                        .await
                        .map_err(PoolerError::relay("flushing to client"))?;
                }
                None => {}
            }
        }
    }

    async fn ensure_lease(&mut self) -> Result<()> {
        if self.lease.is_none() {
            let conn = self.pool.acquire().await?;
            debug!(conn = conn.id(), "leased backend connection");
            self.lease = Some(conn);
        }
        Ok(())
    }

    fn leased(&mut self) -> Result<&mut PgConnection<D::Stream>> {
        self.lease
            .as_mut()
            .map(BackendConnection::connection_mut)
            .ok_or(PoolerError::RelayError {
                stage: "relaying to backend",
                source: PgError::ConnectionClosed,
            })
    }
}

impl<C, D: Dialer> Drop for Session<C, D> {
    fn drop(&mut self) {
        if let Some(conn) = self.lease.take() {
            debug!(
                conn = conn.id(),
                status = ?self.tx_status,
                "discarding backend connection held at session end"
            );
            self.pool.discard(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::PgResult;
    use crate::pool::{PoolConfig, PoolStats};

    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::pg::protocol::{
        BindMessage, DescribeMessage, Encode, ExecuteMessage, ParseMessage, QueryMessage,
        SyncMessage, TerminateMessage,
    };

    /// Dials in-memory backends that answer queries from a tiny script and
    /// record every frame they receive.
    #[derive(Clone, Default)]
    struct ScriptedDialer {
        dials: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedDialer {
        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        fn received(&self) -> Vec<u8> {
            self.received.lock().clone()
        }
    }

    impl Dialer for ScriptedDialer {
        type Stream = DuplexStream;

        fn dial(&self) -> impl Future<Output = PgResult<PgConnection<DuplexStream>>> + Send {
            let this = self.clone();
            async move {
                this.dials.fetch_add(1, Ordering::SeqCst);
                let (client, server) = duplex(64 * 1024);
                tokio::spawn(scripted_backend(server, this.received.clone()));
                Ok(PgConnection::from_stream(client))
            }
        }
    }

    /// `BEGIN` opens a transaction, `COMMIT`/`ROLLBACK` closes it,
    /// `ROWS n` returns n data rows, anything else returns one.
    async fn scripted_backend(stream: DuplexStream, received: Arc<Mutex<Vec<u8>>>) {
        let mut stream = MessageStream::new(stream);
        let mut status = TransactionStatus::Idle;

        while let Ok(frame) = stream.receive().await {
            received.lock().push(frame.tag);

            let mut reply = Vec::new();
            match frame.tag {
                b'Q' => {
                    let sql = String::from_utf8_lossy(&frame.body)
                        .trim_end_matches('\0')
                        .to_string();
                    let rows = match sql.as_str() {
                        "BEGIN" => {
                            status = TransactionStatus::InTransaction;
                            0
                        }
                        "COMMIT" | "ROLLBACK" => {
                            status = TransactionStatus::Idle;
                            0
                        }
                        s => s
                            .strip_prefix("ROWS ")
                            .and_then(|n| n.parse().ok())
                            .unwrap_or(1),
                    };
                    for i in 0..rows {
                        let value = i.to_string();
                        let mut row = vec![0, 1];
                        row.extend_from_slice(&(value.len() as i32).to_be_bytes());
                        row.extend_from_slice(value.as_bytes());
                        reply.push(BackendMessage::Other(Frame::new(b'D', row)));
                    }
                    reply.push(BackendMessage::CommandComplete { tag: sql });
                    reply.push(BackendMessage::ReadyForQuery { status });
                }
                b'S' => {
                    reply.push(BackendMessage::Other(Frame::new(b'1', Bytes::new())));
                    reply.push(BackendMessage::Other(Frame::new(b'2', Bytes::new())));
                    reply.push(BackendMessage::CommandComplete {
                        tag: "SELECT 1".to_string(),
                    });
                    reply.push(BackendMessage::ReadyForQuery { status });
                }
                b'X' => return,
                // Extended-query messages wait for Sync
                _ => continue,
            }

            for msg in &reply {
                if stream.send(msg).await.is_err() {
                    return;
                }
            }
            if stream.flush().await.is_err() {
                return;
            }
        }
    }

    struct Client {
        stream: MessageStream<DuplexStream>,
        session: JoinHandle<Result<()>>,
    }

    impl Client {
        fn connect(pool: &Pool<ScriptedDialer>) -> Self {
            let (ours, theirs) = duplex(64 * 1024);
            let session = Session::new(MessageStream::new(theirs), pool.clone());
            Self {
                stream: MessageStream::new(ours),
                session: tokio::spawn(session.run()),
            }
        }

        async fn send(&mut self, msg: &(dyn Encode + Sync)) {
            self.stream.send(msg).await.unwrap();
        }

        async fn flush(&mut self) {
            self.stream.flush().await.unwrap();
        }

        async fn query(&mut self, sql: &str) -> Vec<Frame> {
            self.send(&QueryMessage {
                query: sql.to_string(),
            })
            .await;
            self.flush().await;
            self.until_ready().await
        }

        /// Collect frames through the next ReadyForQuery.
        async fn until_ready(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            loop {
                let frame = self.stream.receive().await.unwrap();
                let done = frame.tag == b'Z';
                frames.push(frame);
                if done {
                    return frames;
                }
            }
        }
    }

    fn status_of(frames: &[Frame]) -> TransactionStatus {
        frames
            .last()
            .and_then(|f| f.ready_for_query_status().ok().flatten())
            .unwrap_or_default()
    }

    fn tags(frames: &[Frame]) -> Vec<u8> {
        frames.iter().map(|f| f.tag).collect()
    }

    fn scripted_pool(max_open: i32) -> (Pool<ScriptedDialer>, ScriptedDialer) {
        let dialer = ScriptedDialer::default();
        let config = PoolConfig::new("postgres://test@localhost/test")
            .max_open(max_open)
            .max_idle(2);
        (Pool::new(config, dialer.clone()), dialer)
    }

    async fn wait_for(pool: &Pool<ScriptedDialer>, cond: impl Fn(&PoolStats) -> bool) {
        for _ in 0..1000 {
            if cond(&pool.stats()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never met, stats: {:?}", pool.stats());
    }

    #[tokio::test]
    async fn test_simple_query_releases_when_idle() {
        let (pool, dialer) = scripted_pool(1);
        let mut client = Client::connect(&pool);

        let frames = client.query("SELECT 1").await;
        assert_eq!(tags(&frames), vec![b'D', b'C', b'Z']);
        assert_eq!(status_of(&frames), TransactionStatus::Idle);

        wait_for(&pool, |s| s.idle == 1 && s.in_use == 0).await;
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_transaction_keeps_lease_until_commit() {
        let (pool, dialer) = scripted_pool(2);
        let mut client = Client::connect(&pool);

        let frames = client.query("BEGIN").await;
        assert_eq!(status_of(&frames), TransactionStatus::InTransaction);
        assert_eq!(pool.stats().in_use, 1);

        let frames = client.query("SELECT 1").await;
        assert_eq!(status_of(&frames), TransactionStatus::InTransaction);
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(dialer.dials(), 1);

        let frames = client.query("COMMIT").await;
        assert_eq!(status_of(&frames), TransactionStatus::Idle);
        wait_for(&pool, |s| s.idle == 1 && s.in_use == 0).await;

        // Every statement of the transaction went to the same backend.
        assert_eq!(dialer.received(), vec![b'Q', b'Q', b'Q']);
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_extended_query_is_forwarded_at_sync() {
        let (pool, dialer) = scripted_pool(1);
        let mut client = Client::connect(&pool);

        client
            .send(&ParseMessage {
                name: String::new(),
                query: "SELECT $1".to_string(),
                param_types: vec![],
            })
            .await;
        client
            .send(&BindMessage {
                portal: String::new(),
                statement: String::new(),
                params: vec![Some(Bytes::from_static(b"1"))],
            })
            .await;
        client
            .send(&DescribeMessage {
                kind: b'P',
                name: String::new(),
            })
            .await;
        client
            .send(&ExecuteMessage {
                portal: String::new(),
                max_rows: 0,
            })
            .await;
        client.flush().await;

        // The session leased a backend but hasn't sent it anything yet.
        wait_for(&pool, |s| s.in_use == 1).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(dialer.received().is_empty());

        client.send(&SyncMessage).await;
        client.flush().await;

        let frames = client.until_ready().await;
        assert_eq!(tags(&frames), vec![b'1', b'2', b'C', b'Z']);
        assert_eq!(dialer.received(), vec![b'P', b'B', b'D', b'E', b'S']);
        wait_for(&pool, |s| s.idle == 1 && s.in_use == 0).await;
    }

    #[tokio::test]
    async fn test_long_response_relayed_in_order() {
        let (pool, _dialer) = scripted_pool(1);
        let mut client = Client::connect(&pool);

        let frames = client.query("ROWS 25").await;

        assert_eq!(frames.len(), 27);
        assert!(frames[..25].iter().all(|f| f.tag == b'D'));
        assert_eq!(frames[25].tag, b'C');
        assert_eq!(frames[26].tag, b'Z');
    }

    #[tokio::test]
    async fn test_sessions_share_backend_between_transactions() {
        let (pool, dialer) = scripted_pool(1);
        let mut first = Client::connect(&pool);
        let mut second = Client::connect(&pool);

        first.query("BEGIN").await;

        // The only backend is pinned to the first session.
        let waiting = tokio::spawn(async move {
            let frames = second.query("SELECT 1").await;
            (second, frames)
        });
        wait_for(&pool, |s| s.waiting == 1).await;

        first.query("COMMIT").await;
        let (_second, frames) = waiting.await.unwrap();
        assert_eq!(status_of(&frames), TransactionStatus::Idle);
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn test_terminate_inside_transaction_discards_backend() {
        let (pool, _dialer) = scripted_pool(1);
        let mut client = Client::connect(&pool);

        client.query("BEGIN").await;
        client.send(&TerminateMessage).await;
        client.flush().await;

        client.session.await.unwrap().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_inside_extended_query() {
        let (pool, _dialer) = scripted_pool(1);
        let Client {
            mut stream,
            session,
        } = Client::connect(&pool);

        stream
            .send(&ParseMessage {
                name: String::new(),
                query: "SELECT 1".to_string(),
                param_types: vec![],
            })
            .await
            .unwrap();
        stream.flush().await.unwrap();
        wait_for(&pool, |s| s.in_use == 1).await;
        drop(stream);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PoolerError::RelayError {
                stage: "receiving extended query message from client",
                ..
            }
        ));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_acquire_failure_reported_to_client() {
        let (pool, _dialer) = scripted_pool(1);
        pool.close().await.unwrap();
        let mut client = Client::connect(&pool);

        client
            .send(&QueryMessage {
                query: "SELECT 1".to_string(),
            })
            .await;
        client.flush().await;

        let frame = client.stream.receive().await.unwrap();
        let msg = BackendMessage::decode(frame).unwrap();
        assert_eq!(msg.field(b'S'), Some("FATAL"));
        assert_eq!(msg.field(b'C'), Some("53300"));

        let result = tokio::time::timeout(Duration::from_secs(1), client.session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PoolerError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_unknown_frontend_message_ends_session() {
        let (pool, _dialer) = scripted_pool(1);
        let mut client = Client::connect(&pool);

        client.send(&Frame::new(b'F', Bytes::new())).await;
        client.flush().await;

        let result = client.session.await.unwrap();
        assert!(matches!(
            result,
            Err(PoolerError::RelayError {
                source: PgError::Protocol(_),
                ..
            })
        ));
        assert_eq!(pool.stats().open, 0);
    }
}
