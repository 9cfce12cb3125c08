//! PostgreSQL wire protocol message encoding and decoding.
//!
//! The relay path never needs to understand most messages: it moves
//! [`Frame`]s (tag byte plus body) between sockets untouched and only looks
//! at the tag, or at the status byte of a `ReadyForQuery`. Typed messages
//! exist for the parts of the protocol the proxy speaks itself: the
//! backend startup/authentication exchange and the client handshake.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// SSLRequest magic number
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// GSSENCRequest magic number
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

/// CancelRequest magic number
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Tag byte of the backend `ReadyForQuery` message.
pub const READY_FOR_QUERY: u8 = b'Z';

/// Backend-reported transaction status, as carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// No `ReadyForQuery` observed yet
    #[default]
    Unset,
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Map a wire status byte. Unknown bytes yield `None`.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Wire byte for this status. `Unset` has no wire form and encodes as idle.
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Unset | TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    /// Whether a backend in this state may be handed to another client.
    pub fn is_releasable(self) -> bool {
        self == TransactionStatus::Idle
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One tagged protocol message as it travels on the wire.
///
/// The body excludes the tag byte and the length word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn new(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    /// Total encoded length, tag byte included.
    pub fn wire_len(&self) -> usize {
        1 + 4 + self.body.len()
    }

    /// Append the wire form of this frame to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u8(self.tag);
        dst.put_i32(self.body.len() as i32 + 4);
        dst.put_slice(&self.body);
    }

    /// Interpret this frame as a message sent by a client.
    pub fn frontend_kind(&self) -> FrontendKind {
        FrontendKind::from_tag(self.tag)
    }

    /// If this is a backend `ReadyForQuery`, return its transaction status.
    pub fn ready_for_query_status(&self) -> PgResult<Option<TransactionStatus>> {
        if self.tag != READY_FOR_QUERY {
            return Ok(None);
        }
        let byte = *self
            .body
            .first()
            .ok_or_else(|| PgError::Protocol("ReadyForQuery without status".to_string()))?;
        TransactionStatus::from_byte(byte).map(Some).ok_or_else(|| {
            PgError::Protocol(format!("Unknown transaction status: {:?}", byte as char))
        })
    }
}

/// Frontend message kinds the proxy dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendKind {
    Query,
    Parse,
    Bind,
    Describe,
    Execute,
    Close,
    Flush,
    Sync,
    Terminate,
    Other(u8),
}

impl FrontendKind {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            b'Q' => FrontendKind::Query,
            b'P' => FrontendKind::Parse,
            b'B' => FrontendKind::Bind,
            b'D' => FrontendKind::Describe,
            b'E' => FrontendKind::Execute,
            b'C' => FrontendKind::Close,
            b'H' => FrontendKind::Flush,
            b'S' => FrontendKind::Sync,
            b'X' => FrontendKind::Terminate,
            other => FrontendKind::Other(other),
        }
    }

    /// Messages that belong to the extended-query sub-protocol.
    pub fn is_extended_query(self) -> bool {
        matches!(
            self,
            FrontendKind::Parse
                | FrontendKind::Bind
                | FrontendKind::Describe
                | FrontendKind::Execute
                | FrontendKind::Close
                | FrontendKind::Flush
                | FrontendKind::Sync
        )
    }
}

/// Anything that can be written to the wire.
pub trait Encode {
    fn encode(&self) -> BytesMut;
}

impl Encode for Frame {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut buf);
        buf
    }
}

/// Build a tagged message from a body closure, filling in the length word.
fn tagged(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl Encode for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // Placeholder for length (will be filled in at the end)
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstring(&mut buf, "user");
        put_cstring(&mut buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(&mut buf, "database");
            put_cstring(&mut buf, db);
        }

        for (key, value) in &self.options {
            put_cstring(&mut buf, key);
            put_cstring(&mut buf, value);
        }

        // Terminator
        buf.put_u8(0);

        // Untagged: the length includes itself and nothing precedes it
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        buf
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl Encode for PasswordMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| put_cstring(buf, &self.password))
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl Encode for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| {
            put_cstring(buf, &self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(&self.data);
        })
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl Encode for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| buf.put_slice(&self.data))
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl Encode for QueryMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'Q', |buf| put_cstring(buf, &self.query))
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<u32>,
}

impl Encode for ParseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'P', |buf| {
            put_cstring(buf, &self.name);
            put_cstring(buf, &self.query);
            buf.put_i16(self.param_types.len() as i16);
            for oid in &self.param_types {
                buf.put_u32(*oid);
            }
        })
    }
}

/// Bind message ('B') - Binds text-format parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub params: Vec<Option<Bytes>>,
}

impl Encode for BindMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'B', |buf| {
            put_cstring(buf, &self.portal);
            put_cstring(buf, &self.statement);
            // No parameter format codes: all text
            buf.put_i16(0);
            buf.put_i16(self.params.len() as i16);
            for param in &self.params {
                match param {
                    Some(value) => {
                        buf.put_i32(value.len() as i32);
                        buf.put_slice(value);
                    }
                    None => buf.put_i32(-1),
                }
            }
            // No result format codes: all text
            buf.put_i16(0);
        })
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl Encode for DescribeMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'D', |buf| {
            buf.put_u8(self.kind);
            put_cstring(buf, &self.name);
        })
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl Encode for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'E', |buf| {
            put_cstring(buf, &self.portal);
            buf.put_i32(self.max_rows);
        })
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl Encode for SyncMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'S', |_| {})
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl Encode for TerminateMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'X', |_| {})
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Backend messages the proxy needs to understand or produce.
///
/// Everything else is carried opaquely as [`BackendMessage::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    CommandComplete { tag: String },

    // Errors and notices, fields in wire order
    ErrorResponse { fields: Vec<(u8, String)> },
    NoticeResponse { fields: Vec<(u8, String)> },

    Other(Frame),
}

impl BackendMessage {
    /// A FATAL error response carrying a SQLSTATE and a message.
    pub fn fatal(code: &str, message: &str) -> Self {
        BackendMessage::ErrorResponse {
            fields: vec![
                (b'S', "FATAL".to_string()),
                (b'V', "FATAL".to_string()),
                (b'C', code.to_string()),
                (b'M', message.to_string()),
            ],
        }
    }

    /// Decode a backend message from a received frame.
    pub fn decode(frame: Frame) -> PgResult<Self> {
        let mut body = frame.body.clone();

        match frame.tag {
            b'R' => Self::decode_auth(body),
            b'Z' => {
                let status = frame.ready_for_query_status()?.unwrap_or_default();
                Ok(BackendMessage::ReadyForQuery { status })
            }
            b'S' => {
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                ensure(&body, 8)?;
                let process_id = body.get_i32();
                let secret_key = body.get_i32();
                Ok(BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                })
            }
            b'C' => {
                let tag = read_cstring(&mut body)?;
                Ok(BackendMessage::CommandComplete { tag })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            _ => Ok(BackendMessage::Other(frame)),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 4)?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                ensure(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    /// Look up one field of an error or notice response.
    pub fn field(&self, code: u8) -> Option<&str> {
        match self {
            BackendMessage::ErrorResponse { fields }
            | BackendMessage::NoticeResponse { fields } => fields
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

impl Encode for BackendMessage {
    fn encode(&self) -> BytesMut {
        match self {
            BackendMessage::AuthenticationOk => tagged(b'R', |buf| buf.put_i32(0)),
            BackendMessage::AuthenticationCleartextPassword => tagged(b'R', |buf| buf.put_i32(3)),
            BackendMessage::AuthenticationMD5Password { salt } => tagged(b'R', |buf| {
                buf.put_i32(5);
                buf.put_slice(salt);
            }),
            BackendMessage::AuthenticationSASL { mechanisms } => tagged(b'R', |buf| {
                buf.put_i32(10);
                for mech in mechanisms {
                    put_cstring(buf, mech);
                }
                buf.put_u8(0);
            }),
            BackendMessage::AuthenticationSASLContinue { data } => tagged(b'R', |buf| {
                buf.put_i32(11);
                buf.put_slice(data);
            }),
            BackendMessage::AuthenticationSASLFinal { data } => tagged(b'R', |buf| {
                buf.put_i32(12);
                buf.put_slice(data);
            }),
            BackendMessage::ReadyForQuery { status } => {
                tagged(READY_FOR_QUERY, |buf| buf.put_u8(status.as_byte()))
            }
            BackendMessage::ParameterStatus { name, value } => tagged(b'S', |buf| {
                put_cstring(buf, name);
                put_cstring(buf, value);
            }),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => tagged(b'K', |buf| {
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
            }),
            BackendMessage::CommandComplete { tag } => tagged(b'C', |buf| put_cstring(buf, tag)),
            BackendMessage::ErrorResponse { fields } => encode_fields(b'E', fields),
            BackendMessage::NoticeResponse { fields } => encode_fields(b'N', fields),
            BackendMessage::Other(frame) => frame.encode(),
        }
    }
}

fn encode_fields(tag: u8, fields: &[(u8, String)]) -> BytesMut {
    tagged(tag, |buf| {
        for (code, value) in fields {
            buf.put_u8(*code);
            put_cstring(buf, value);
        }
        buf.put_u8(0);
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

fn ensure(buf: &Bytes, n: usize) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol("Truncated message body".to_string()));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
pub(crate) fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<Vec<(u8, String)>> {
    let mut fields = Vec::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.push((field_type, value));
    }

    Ok(fields)
}
