//! Keep-only-latest frame sender.
//!
//! ```text
//! capture ──offer()──► [ slot: Option<Frame> ] ──writer task──► socket
//!                         ▲ newer frame replaces an unsent one
//! ```
//!
//! `offer` never waits on the network. The writer task takes whatever is in
//! the slot when the previous write completes, so at most one frame is in
//! flight and the newest frame always wins.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use camstream_core::{ConnectionError, Frame, TransportError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::FrameCodec;

// ── DeliveryStats ─────────────────────────────────────────────────────────────

/// Frame delivery counters. `written + dropped <= captured` at all times.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    captured: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl DeliveryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames offered to the sender.
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Frames fully written to the socket.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Frames replaced by a newer one, or discarded at teardown, before being written.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

// ── LatestFrameSender ─────────────────────────────────────────────────────────

struct Shared {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
    closed: AtomicBool,
    stats: Arc<DeliveryStats>,
}

impl Shared {
    fn take(&self) -> Option<Frame> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Capture-side handle of a frame writer task.
///
/// Dropping the sender lets the writer finish its current write and exit;
/// aborting the returned [`JoinHandle`] abandons the write immediately.
pub struct LatestFrameSender {
    shared: Arc<Shared>,
}

impl LatestFrameSender {
    /// Start a writer task that owns `writer`.
    pub fn spawn<W>(
        writer: W,
        codec: Arc<dyn FrameCodec>,
        stats: Arc<DeliveryStats>,
    ) -> (Self, JoinHandle<Result<(), TransportError>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        });
        let task = tokio::spawn(write_loop(writer, codec, Arc::clone(&shared)));
        (Self { shared }, task)
    }

    /// Hand a frame to the writer without waiting. An unsent older frame is dropped.
    pub fn offer(&self, frame: Frame) {
        let stats = &self.shared.stats;
        stats.record_captured();
        let replaced = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame);
        if replaced.is_some() {
            stats.record_dropped();
        }
        self.shared.notify.notify_one();
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        &self.shared.stats
    }

    /// True once the writer task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for LatestFrameSender {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

async fn write_loop<W>(
    mut writer: W,
    codec: Arc<dyn FrameCodec>,
    shared: Arc<Shared>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(codec.wire_len());

    let result = loop {
        shared.notify.notified().await;
        if shared.closed.load(Ordering::Acquire) {
            break Ok(());
        }
        let Some(frame) = shared.take() else { continue };

        buf.clear();
        if let Err(e) = codec.encode(&frame, &mut buf) {
            warn!("[Transport] dropping frame: {}", e);
            shared.stats.record_dropped();
            continue;
        }
        let write = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            break Err(ConnectionError::from_io(e).into());
        }
        shared.stats.written.fetch_add(1, Ordering::Relaxed);
    };

    shared.closed.store(true, Ordering::Release);
    if shared.take().is_some() {
        shared.stats.record_dropped();
    }
    let _ = writer.shutdown().await;
    debug!(
        "[Transport] writer exiting (written={} dropped={})",
        shared.stats.written(),
        shared.stats.dropped()
    );
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camstream_core::{FrameFormat, Framing};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::codec::codec_for;
    use crate::reader::FrameReader;

    fn frame(fill: u8) -> Frame {
        Frame::new(FrameFormat::REFERENCE, vec![fill; 100]).unwrap()
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (tx, rx) = tokio::io::duplex(4096);
        let codec = codec_for(Framing::Raw, FrameFormat::REFERENCE);
        let (sender, task) = LatestFrameSender::spawn(tx, Arc::clone(&codec), DeliveryStats::new());
        let mut reader = FrameReader::new(rx, codec);

        for i in 0..5u8 {
            sender.offer(frame(i));
            let got = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(got, frame(i));
        }
        assert_eq!(sender.stats().written(), 5);
        assert_eq!(sender.stats().dropped(), 0);

        drop(sender);
        task.await.unwrap().unwrap();
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_reader_sees_newest_frame_and_counters_balance() {
        // 100-byte pipe: one frame fills it, so the writer blocks on the second.
        let (tx, mut rx) = tokio::io::duplex(100);
        let codec = codec_for(Framing::Raw, FrameFormat::REFERENCE);
        let (sender, task) = LatestFrameSender::spawn(tx, Arc::clone(&codec), DeliveryStats::new());

        for i in 0..50u8 {
            sender.offer(frame(i));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut received = Vec::new();
        let mut buf = [0u8; 100];
        // drain whatever got written; last frame must be the newest
        loop {
            match tokio::time::timeout(Duration::from_millis(100), rx.read_exact(&mut buf)).await {
                Ok(Ok(_)) => received.push(buf[0]),
                _ => break,
            }
        }

        let stats = Arc::clone(sender.stats());
        assert_eq!(stats.captured(), 50);
        assert!(stats.written() < 50, "backpressure should have dropped frames");
        assert!(stats.written() + stats.dropped() <= stats.captured());
        assert_eq!(received.len() as u64, stats.written());
        assert_eq!(received.last(), Some(&49));
        assert!(received.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", received);

        drop(sender);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_failure_ends_the_writer_with_an_error() {
        let (tx, rx) = tokio::io::duplex(16);
        drop(rx);
        let codec = codec_for(Framing::Raw, FrameFormat::REFERENCE);
        let (sender, task) = LatestFrameSender::spawn(tx, codec, DeliveryStats::new());
        sender.offer(frame(1));
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert!(sender.is_closed());
    }
}
