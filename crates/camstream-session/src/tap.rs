use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camstream_capture::FrameSink;
use camstream_core::Frame;
use camstream_transport::LatestFrameSender;

/// The point where camera output meets the active session.
///
/// Holds at most one [`LatestFrameSender`]. The camera callback calls
/// [`FrameSink::offer`] on the tap; while no session is bound the frame is
/// discarded. Binding and unbinding go through the same mutex as `offer`, so a
/// frame is never handed to a session that is being torn down.
#[derive(Default)]
pub struct FrameTap {
    sender: Mutex<Option<LatestFrameSender>>,
    unbound: AtomicU64,
}

impl FrameTap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Option<LatestFrameSender>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a session. Hands the sender back if one is already bound.
    pub(crate) fn bind(&self, sender: LatestFrameSender) -> Result<(), LatestFrameSender> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(sender);
        }
        *slot = Some(sender);
        Ok(())
    }

    /// Detach the current session. Dropping the returned sender stops its writer.
    pub(crate) fn unbind(&self) -> Option<LatestFrameSender> {
        self.lock().take()
    }

    pub fn is_bound(&self) -> bool {
        self.lock().is_some()
    }

    /// Frames offered while no session was bound.
    pub fn unbound_frames(&self) -> u64 {
        self.unbound.load(Ordering::Relaxed)
    }
}

impl FrameSink for FrameTap {
    fn offer(&self, frame: Frame) {
        match self.lock().as_ref() {
            Some(sender) if !sender.is_closed() => sender.offer(frame),
            _ => {
                self.unbound.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use camstream_core::{FrameFormat, Framing};
    use camstream_transport::{codec_for, DeliveryStats, FrameReader};

    use super::*;

    fn frame(fill: u8) -> Frame {
        Frame::new(FrameFormat::REFERENCE, vec![fill; 100]).unwrap()
    }

    #[tokio::test]
    async fn offers_go_nowhere_until_bound() {
        let tap = FrameTap::new();
        tap.offer(frame(1));
        assert_eq!(tap.unbound_frames(), 1);

        let (tx, rx) = tokio::io::duplex(1024);
        let codec = codec_for(Framing::Raw, FrameFormat::REFERENCE);
        let (sender, _task) = LatestFrameSender::spawn(tx, codec.clone(), DeliveryStats::new());
        assert!(tap.bind(sender).is_ok());
        assert!(tap.is_bound());

        tap.offer(frame(2));
        let mut reader = FrameReader::new(rx, codec);
        assert_eq!(reader.next_frame().await.unwrap(), Some(frame(2)));

        drop(tap.unbind());
        assert!(!tap.is_bound());
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_bind_is_refused() {
        let tap = FrameTap::new();
        let codec = codec_for(Framing::Raw, FrameFormat::REFERENCE);
        let (a, _) = tokio::io::duplex(64);
        let (b, _) = tokio::io::duplex(64);
        let (first, _t1) = LatestFrameSender::spawn(a, codec.clone(), DeliveryStats::new());
        let (second, _t2) = LatestFrameSender::spawn(b, codec, DeliveryStats::new());

        assert!(tap.bind(first).is_ok());
        assert!(tap.bind(second).is_err());
    }
}
