use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use camstream_core::{ConnectionError, Frame, ProtocolMismatchError, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::codec::FrameCodec;

/// Consumer side of the frame stream: reads exactly one frame per call.
pub struct FrameReader<R> {
    inner: R,
    codec: Arc<dyn FrameCodec>,
    buf: BytesMut,
    stall_timeout: Option<Duration>,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: Arc<dyn FrameCodec>) -> Self {
        let buf = BytesMut::with_capacity(codec.wire_len() * 4);
        Self { inner, codec, buf, stall_timeout: None, frames_read: 0 }
    }

    /// Fail with [`ProtocolMismatchError::Stalled`] when a frame takes longer
    /// than `timeout` to arrive.
    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Next frame, or `None` on a clean EOF at a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                self.frames_read += 1;
                return Ok(Some(frame));
            }

            let n = match self.stall_timeout {
                Some(limit) => tokio::time::timeout(limit, self.inner.read_buf(&mut self.buf))
                    .await
                    .map_err(|_| ProtocolMismatchError::Stalled {
                        expected: self.codec.wire_len(),
                        got: self.buf.len(),
                        ms: limit.as_millis() as u64,
                    })?,
                None => self.inner.read_buf(&mut self.buf).await,
            }
            .map_err(ConnectionError::from_io)?;

            if n == 0 {
                if self.buf.is_empty() {
                    debug!("[Transport] EOF after {} frames", self.frames_read);
                    return Ok(None);
                }
                return Err(ProtocolMismatchError::Truncated {
                    expected: self.codec.wire_len(),
                    got: self.buf.len(),
                }
                .into());
            }
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}
