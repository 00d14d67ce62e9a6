//! Buffered frame reader over an async byte stream.

use bytes::{Buf, BytesMut};
use protocol::{Frame, FrameCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Initial capacity of the read buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Reads whole frames from a socket half.
///
/// [`FrameReader::read_frame`] is cancel-safe: partially received frames
/// stay buffered, so the call may be raced against a timeout and retried.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a reader with the default codec.
    pub fn new(inner: R) -> Self {
        Self::with_codec(inner, FrameCodec::new())
    }

    /// Wraps a reader with a custom codec.
    pub fn with_codec(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            codec,
        }
    }

    /// Reads the next frame.
    ///
    /// End of stream is reported as [`ProtocolError::ConnectionClosed`],
    /// whether it falls between frames or inside one.
    pub async fn read_frame(&mut self) -> protocol::Result<Frame> {
        loop {
            if let Some((frame, used)) = self.codec.try_decode(&self.buffer)? {
                self.buffer.advance(used);
                return Ok(frame);
            }

            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                let reason = if self.buffer.is_empty() {
                    "closed by peer".to_string()
                } else {
                    format!("closed by peer mid-frame with {} bytes buffered", self.buffer.len())
                };
                return Err(ProtocolError::ConnectionClosed(reason));
            }
        }
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
