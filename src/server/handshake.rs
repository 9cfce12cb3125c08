//! Client startup exchange.
//!
//! Clients are trusted: any startup packet is answered with AuthenticationOk.
//! Encryption is refused so the client falls back to plaintext.

use bytes::Buf;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::pg::protocol::{
    read_cstring, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::pg::{BackendMessage, MessageStream, PgError, TransactionStatus};

/// How a client's startup phase ended.
#[derive(Debug, PartialEq)]
pub enum Handshake {
    /// The client is ready to send queries.
    Ready {
        user: String,
        database: Option<String>,
    },
    /// The connection only carried a cancel request.
    Cancel { process_id: i32 },
}

/// Run the startup exchange on a fresh client connection.
pub async fn handshake<S>(
    stream: &mut MessageStream<S>,
    pid: i32,
    server_version: &str,
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let mut packet = stream.receive_startup().await?;
        if packet.remaining() < 4 {
            return Err(PgError::Protocol("startup packet too short".to_string()).into());
        }

        match packet.get_i32() {
            SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
                stream.write_raw(b"N").await?;
                stream.flush().await?;
            }
            CANCEL_REQUEST_CODE => {
                let process_id = if packet.remaining() >= 4 {
                    packet.get_i32()
                } else {
                    0
                };
                return Ok(Handshake::Cancel { process_id });
            }
            PROTOCOL_VERSION => {
                let mut user = None;
                let mut database = None;
                while packet.has_remaining() {
                    let name = read_cstring(&mut packet)?;
                    if name.is_empty() {
                        break;
                    }
                    let value = read_cstring(&mut packet)?;
                    match name.as_str() {
                        "user" => user = Some(value),
                        "database" => database = Some(value),
                        _ => {}
                    }
                }

                let user = match user {
                    Some(user) => user,
                    None => {
                        reject(stream, "28000", "no PostgreSQL user name specified in startup packet")
                            .await;
                        return Err(PgError::Protocol("startup packet without user".to_string()).into());
                    }
                };

                send_startup_info(stream, pid, server_version).await?;
                return Ok(Handshake::Ready { user, database });
            }
            version => {
                reject(
                    stream,
                    "0A000",
                    &format!(
                        "unsupported frontend protocol {}.{}",
                        version >> 16,
                        version & 0xffff
                    ),
                )
                .await;
                return Err(PgError::Protocol(format!(
                    "unsupported protocol version {}",
                    version
                ))
                .into());
            }
        }
    }
}

async fn send_startup_info<S>(
    stream: &mut MessageStream<S>,
    pid: i32,
    server_version: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    stream.send(&BackendMessage::AuthenticationOk).await?;

    let params = [
        ("server_version", server_version),
        ("server_encoding", "UTF8"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
        ("TimeZone", "UTC"),
        ("integer_datetimes", "on"),
        ("standard_conforming_strings", "on"),
    ];
    for (name, value) in params {
        stream
            .send(&BackendMessage::ParameterStatus {
                name: name.to_string(),
                value: value.to_string(),
            })
            .await?;
    }

    // ThreadRng is not Send, so it must not live across the await below.
    let secret_key: i32 = rand::thread_rng().gen();
    stream
        .send(&BackendMessage::BackendKeyData {
            process_id: pid,
            secret_key,
        })
        .await?;
    stream
        .send(&BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        })
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Best-effort FATAL error before hanging up.
async fn reject<S>(stream: &mut MessageStream<S>, code: &str, message: &str)
where
    S: AsyncRead + AsyncWrite,
{
    if stream.send(&BackendMessage::fatal(code, message)).await.is_ok() {
        let _ = stream.flush().await;
    }
}
