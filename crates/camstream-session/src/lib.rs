//! camstream-session — the producer and consumer state machines.
//!
//! ```text
//! Producer::start ── bind :0 ── advertise ──► ProducerHandle
//!                                               │ frame_tap() ◄── camera
//!                                               ▼
//!                               FrameTap ── LatestFrameSender ── TCP ──┐
//!                                                                      │
//! Consumer::start ── browse ── resolve ── connect ──► ConsumerHandle ◄─┘
//!                                                       next_frame()
//! ```
//!
//! Each side publishes its state on a `watch` channel; the handles expose the
//! current value and a receiver for awaiting transitions.

mod candidates;
pub mod consumer;
pub mod producer;
pub mod tap;

pub use consumer::{Consumer, ConsumerHandle};
pub use producer::{Producer, ProducerHandle};
pub use tap::FrameTap;
