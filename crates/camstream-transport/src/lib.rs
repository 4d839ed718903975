//! camstream-transport — the producer→consumer frame socket.
//!
//! # Architecture
//!
//! ```text
//! Producer                                   Consumer
//! ─────────────────────────────────          ─────────────────────────────
//! FrameListener (TCP, port 0)  ◄──────────── connect(endpoint)
//!   │ accept()                                  │
//!   ▼                                           ▼
//! LatestFrameSender ── frames, no ack ──────► FrameReader::next_frame()
//!   (keep-only-latest)                          (exactly one frame per call)
//! ```
//!
//! The wire carries frames only; there is no acknowledgment channel. Framing
//! lives behind [`FrameCodec`] so it can change without touching sessions.

pub mod codec;
pub mod listener;
pub mod reader;
pub mod sender;

pub use codec::{codec_for, FrameCodec, LengthPrefixedCodec, RawCodec};
pub use listener::{connect, FrameListener};
pub use reader::FrameReader;
pub use sender::{DeliveryStats, LatestFrameSender};
