//! Buffered framing over an arbitrary byte stream.
//!
//! Both sides of the proxy use the same primitive: `send` buffers a message,
//! `flush` pushes everything buffered onto the socket, `receive` yields one
//! complete frame. Nothing is written to the socket until `flush` (or until
//! the write buffer overflows).

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};

use super::error::{PgError, PgResult};
use super::protocol::{Encode, Frame};

/// Maximum accepted frame size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read buffer size; large enough for a typical batch of result rows.
const READ_BUFFER_CAPACITY: usize = 32 * 1024;

/// Framed reader/writer for protocol messages.
pub struct MessageStream<S> {
    reader: ReadHalf<S>,
    writer: BufWriter<WriteHalf<S>>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl<S: AsyncRead + AsyncWrite> MessageStream<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: BufWriter::new(writer),
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Override the frame size limit.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Buffer a message without flushing.
    pub async fn send<M: Encode + ?Sized>(&mut self, msg: &M) -> PgResult<()> {
        let encoded = msg.encode();
        self.writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Buffer a raw frame without flushing.
    #[inline]
    pub async fn send_frame(&mut self, frame: &Frame) -> PgResult<()> {
        self.send(frame).await
    }

    /// Flush buffered messages.
    #[inline]
    pub async fn flush(&mut self) -> PgResult<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive one tagged frame.
    pub async fn receive(&mut self) -> PgResult<Frame> {
        loop {
            if self.read_buffer.len() >= 5 {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                let length = self.checked_length(length)?;

                // type byte + length word value (length word counts itself)
                let total_len = 1 + length;
                if self.read_buffer.len() >= total_len {
                    let mut msg = self.read_buffer.split_to(total_len);
                    let tag = msg.get_u8();
                    msg.advance(4);
                    return Ok(Frame::new(tag, msg.freeze()));
                }
            }

            self.fill().await?;
        }
    }

    /// Receive an untagged startup-phase packet and return its body
    /// (everything after the length word).
    pub async fn receive_startup(&mut self) -> PgResult<Bytes> {
        loop {
            if self.read_buffer.len() >= 4 {
                let length = i32::from_be_bytes([
                    self.read_buffer[0],
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                ]);
                let length = self.checked_length(length)?;

                if self.read_buffer.len() >= length {
                    let mut msg = self.read_buffer.split_to(length);
                    msg.advance(4);
                    return Ok(msg.freeze());
                }
            }

            self.fill().await?;
        }
    }

    /// Write raw bytes that are not a tagged message (e.g. the SSL refusal byte).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> PgResult<()> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Flush and shut down the write side.
    pub async fn shutdown(&mut self) -> PgResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    fn checked_length(&self, length: i32) -> PgResult<usize> {
        if length < 4 {
            return Err(PgError::Protocol(format!("Invalid message length: {}", length)));
        }
        let length = length as usize;
        if length > self.max_message_size {
            return Err(PgError::MessageTooLarge(length));
        }
        Ok(length)
    }

    async fn fill(&mut self) -> PgResult<()> {
        let n = self.reader.read_buf(&mut self.read_buffer).await?;
        if n == 0 {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::protocol::{QueryMessage, SyncMessage};

    #[tokio::test]
    async fn test_receive_reassembles_split_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = MessageStream::new(client);

        let encoded = QueryMessage {
            query: "SELECT 1".to_string(),
        }
        .encode();
        server.write_all(&encoded[..3]).await.unwrap();
        let reader = tokio::spawn(async move { stream.receive().await });
        tokio::task::yield_now().await;
        server.write_all(&encoded[3..]).await.unwrap();

        let frame = reader.await.unwrap().unwrap();
        assert_eq!(frame.tag, b'Q');
        assert_eq!(&frame.body[..], b"SELECT 1\0");
    }

    #[tokio::test]
    async fn test_send_is_buffered_until_flush() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MessageStream::new(client);

        stream.send(&SyncMessage).await.unwrap();
        let mut buf = [0u8; 16];
        let early = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            server.read(&mut buf),
        )
        .await;
        assert!(early.is_err(), "nothing should reach the peer before flush");

        stream.flush().await.unwrap();
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[b'S', 0, 0, 0, 4]);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = MessageStream::new(client).with_max_message_size(16);

        server.write_all(&[b'Q', 0, 0, 1, 0]).await.unwrap();
        assert!(matches!(
            stream.receive().await,
            Err(PgError::MessageTooLarge(256))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = MessageStream::new(client);
        drop(server);

        assert!(matches!(stream.receive().await, Err(PgError::ConnectionClosed)));
    }
}
