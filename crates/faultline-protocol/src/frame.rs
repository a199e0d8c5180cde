// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for TCP stream framing.
//!
//! Every message exchanged between the coordinator and a minion is one frame:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! Control messages are Protobuf-encoded; experiment payloads are opaque
//! bytes produced by the campaign's payload codec.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
}

impl FrameError {
    /// Whether the failure came from the underlying stream rather than from
    /// the bytes it delivered.
    ///
    /// A peer that hangs up mid-message and a socket that errors out are the
    /// same thing to callers: the connection is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FrameError::Io(_) | FrameError::ConnectionClosed | FrameError::Truncated { .. }
        )
    }
}

/// Encode a payload into a length-prefixed frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame to an async writer.
///
/// `write_all` keeps writing through short writes, so either the whole frame
/// reaches the stream or an error is returned.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let encoded = encode_frame(payload)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async reader and return its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, FrameError> {
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    match read_full(reader, &mut header).await? {
        0 => return Err(FrameError::ConnectionClosed),
        LENGTH_PREFIX_SIZE => {}
        received => {
            return Err(FrameError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                received,
            });
        }
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    let received = read_full(reader, &mut payload).await?;
    if received != length {
        return Err(FrameError::Truncated {
            expected: length,
            received,
        });
    }

    Ok(Bytes::from(payload))
}

/// Fill `buf` from the reader, stopping early only at end of stream.
/// Returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Framed codec for exchanging messages on a stream
#[derive(Debug)]
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame's raw payload
    pub async fn recv_raw(&mut self) -> Result<Bytes, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read the next frame and decode it as a protobuf message
    pub async fn recv<M: Message + Default>(&mut self) -> Result<M, FrameError> {
        let payload = self.recv_raw().await?;
        Ok(M::decode(payload)?)
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a raw payload as one frame
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.stream, payload).await
    }

    /// Encode a protobuf message and write it as one frame
    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), FrameError> {
        self.send_raw(&msg.encode_to_vec()).await
    }

    /// Shut down the write half of the stream
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
