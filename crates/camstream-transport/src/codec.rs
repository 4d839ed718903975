//! Frame framing on the byte stream.
//!
//! The session controller only ever talks to a [`FrameCodec`], so swapping the
//! headerless reference format for a length-prefixed one touches nothing above
//! this module.
//!
//! # Raw (reference)
//!
//! ```text
//! [0..N·C]  samples   one byte per channel per sample, row-major
//! ```
//!
//! # Length-prefixed
//!
//! ```text
//! [0..4]    len       u32 BE  payload length (must equal N·C)
//! [4..]     samples
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use camstream_core::{Frame, FrameFormat, Framing, ProtocolMismatchError};

const LEN_PREFIX: usize = 4;

pub trait FrameCodec: Send + Sync + std::fmt::Debug {
    fn format(&self) -> FrameFormat;

    fn framing(&self) -> Framing;

    /// Append the wire form of `frame` to `dst`.
    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolMismatchError>;

    /// Split one frame off the front of `src`, or `None` if a whole frame is
    /// not buffered yet.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolMismatchError>;

    /// Bytes a complete frame occupies on the wire.
    fn wire_len(&self) -> usize;
}

/// Codec for the configured framing.
pub fn codec_for(framing: Framing, format: FrameFormat) -> Arc<dyn FrameCodec> {
    match framing {
        Framing::Raw => Arc::new(RawCodec::new(format)),
        Framing::LengthPrefixed => Arc::new(LengthPrefixedCodec::new(format)),
    }
}

fn check_len(format: FrameFormat, frame: &Frame) -> Result<(), ProtocolMismatchError> {
    let expected = format.frame_len();
    let got = frame.data().len();
    if got != expected {
        return Err(ProtocolMismatchError::WrongLength { expected, got });
    }
    Ok(())
}

// ── RawCodec ──────────────────────────────────────────────────────────────────

/// Headerless fixed-size frames. Both ends must know N·C in advance.
#[derive(Debug, Clone, Copy)]
pub struct RawCodec {
    format: FrameFormat,
}

impl RawCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self { format }
    }
}

impl FrameCodec for RawCodec {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn framing(&self) -> Framing {
        Framing::Raw
    }

    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolMismatchError> {
        check_len(self.format, frame)?;
        dst.extend_from_slice(frame.data());
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolMismatchError> {
        let len = self.format.frame_len();
        if src.len() < len {
            return Ok(None);
        }
        let payload = src.split_to(len).freeze();
        Frame::new(self.format, payload).map(Some)
    }

    fn wire_len(&self) -> usize {
        self.format.frame_len()
    }
}

// ── LengthPrefixedCodec ───────────────────────────────────────────────────────

/// u32 BE length + payload. A bad length is reported instead of silently
/// misaligning every following frame.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    format: FrameFormat,
}

impl LengthPrefixedCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self { format }
    }
}

impl FrameCodec for LengthPrefixedCodec {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn framing(&self) -> Framing {
        Framing::LengthPrefixed
    }

    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolMismatchError> {
        check_len(self.format, frame)?;
        dst.reserve(LEN_PREFIX + frame.data().len());
        dst.put_u32(frame.data().len() as u32);
        dst.extend_from_slice(frame.data());
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolMismatchError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let expected = self.format.frame_len();
        if len != expected {
            return Err(ProtocolMismatchError::WrongLength { expected, got: len });
        }
        if src.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let payload = src.split_to(len).freeze();
        Frame::new(self.format, payload).map(Some)
    }

    fn wire_len(&self) -> usize {
        LEN_PREFIX + self.format.frame_len()
    }
}
