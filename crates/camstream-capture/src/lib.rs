//! camstream-capture — turns camera images into fixed-size sample grids.
//!
//! The camera pipeline itself is an external collaborator. It hands images to
//! this crate through a [`FrameSource`]; each [`CapturedImage`] is released
//! back to the pipeline exactly once, when it is dropped.
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() {
//! use camstream_capture::{run_capture, FrameSampler, SyntheticSource};
//! use camstream_core::{FrameFormat, SampleMode};
//! use tokio::sync::mpsc;
//!
//! let mut source = SyntheticSource::new(64, 48, 30);
//! let sampler = FrameSampler::new(FrameFormat::REFERENCE, SampleMode::Downsample);
//! let (tx, mut rx) = mpsc::channel::<camstream_core::Frame>(4);
//! tokio::spawn(async move { run_capture(&mut source, &sampler, &tx).await });
//! while let Some(frame) = rx.recv().await {
//!     // frame.data(): 100 bytes, one per sample
//! }
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! camera pipeline ──► FrameSource::next_image()
//!                            │
//!                      FrameSampler::sample()   (image released here)
//!                            │
//!                      FrameSink::offer()  ──► transport (keep-only-latest)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use camstream_core::Frame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod sampler;
mod synthetic;

pub use sampler::FrameSampler;
pub use synthetic::SyntheticSource;

// ── Public types ──────────────────────────────────────────────────────────────

/// Pixel layout of a captured image. Buffers are tightly packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 4 bytes per pixel: Blue, Green, Red, unused.
    Bgrx8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
    /// 1 byte per pixel, luma only.
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgrx8 => 4,
            Self::Rgb8 => 3,
            Self::Gray8 => 1,
        }
    }

    /// Decode one pixel into `[r, g, b, a]`.
    pub fn rgba(&self, px: &[u8]) -> [u8; 4] {
        match self {
            Self::Rgba8 => [px[0], px[1], px[2], px[3]],
            Self::Bgrx8 => [px[2], px[1], px[0], 0xff],
            Self::Rgb8 => [px[0], px[1], px[2], 0xff],
            Self::Gray8 => [px[0], px[0], px[0], 0xff],
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rgba8 => "RGBA8",
            Self::Bgrx8 => "BGRx8",
            Self::Rgb8 => "RGB8",
            Self::Gray8 => "GRAY8",
        };
        f.write_str(s)
    }
}

/// A raw camera image on loan from the camera pipeline.
///
/// Dropping the image runs its release hook, handing the buffer back.
pub struct CapturedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Presentation timestamp in milliseconds.
    pub pts_ms: u64,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CapturedImage {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat, pts_ms: u64) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            pts_ms,
            release: None,
        }
    }

    /// Attach the hook the camera pipeline needs called once the image is done.
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Pixel at (x, y), or `None` when outside the image or the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        self.data.get(start..start + bpp)
    }
}

impl Drop for CapturedImage {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("pts_ms", &self.pts_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Where camera images come from.
#[async_trait]
pub trait FrameSource: Send {
    /// Await the next image. Returns `None` when the camera session ends.
    async fn next_image(&mut self) -> Option<CapturedImage>;
}

#[async_trait]
impl FrameSource for mpsc::Receiver<CapturedImage> {
    async fn next_image(&mut self) -> Option<CapturedImage> {
        self.recv().await
    }
}

/// Where sampled frames go. `offer` must never block the capture path.
pub trait FrameSink: Send + Sync {
    fn offer(&self, frame: Frame);
}

impl FrameSink for mpsc::Sender<Frame> {
    fn offer(&self, frame: Frame) {
        // Full channel means the consumer is behind; the frame is dropped.
        let _ = self.try_send(frame);
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn offer(&self, frame: Frame) {
        (**self).offer(frame)
    }
}

// ── Capture loop ──────────────────────────────────────────────────────────────

/// Counters for one [`run_capture`] run.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub images: AtomicU64,
    pub sampled: AtomicU64,
    pub failed: AtomicU64,
}

impl CaptureStats {
    pub fn images(&self) -> u64 {
        self.images.load(Ordering::Relaxed)
    }

    pub fn sampled(&self) -> u64 {
        self.sampled.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Pull images from `source`, sample each, and offer the result to `sink`
/// until the source ends.
pub async fn run_capture<S, K>(source: &mut S, sampler: &FrameSampler, sink: &K) -> CaptureStats
where
    S: FrameSource + ?Sized,
    K: FrameSink + ?Sized,
{
    let stats = CaptureStats::default();
    info!("Capture loop started (grid={})", sampler.format());

    while let Some(image) = source.next_image().await {
        stats.images.fetch_add(1, Ordering::Relaxed);
        let result = sampler.sample(&image);
        drop(image);

        match result {
            Ok(frame) => {
                stats.sampled.fetch_add(1, Ordering::Relaxed);
                sink.offer(frame);
            }
            Err(e) => {
                let failed = stats.failed.fetch_add(1, Ordering::Relaxed);
                if failed < 20 || failed % 120 == 0 {
                    warn!("Sampling failed: {}", e);
                }
            }
        }
    }

    debug!(
        "Capture source ended (images={} sampled={} failed={})",
        stats.images(),
        stats.sampled(),
        stats.failed()
    );
    stats
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use camstream_core::{FrameFormat, SampleMode};

    use super::*;

    #[test]
    fn dropping_an_image_releases_it_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&released);
        let image = CapturedImage::new(vec![0u8; 4], 1, 1, PixelFormat::Rgba8, 0)
            .with_release(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(image);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pixel_decoding() {
        assert_eq!(PixelFormat::Bgrx8.rgba(&[1, 2, 3, 0]), [3, 2, 1, 0xff]);
        assert_eq!(PixelFormat::Gray8.rgba(&[7]), [7, 7, 7, 0xff]);
    }

    #[tokio::test]
    async fn capture_loop_samples_releases_and_counts() {
        let released = Arc::new(AtomicUsize::new(0));
        let (img_tx, mut img_rx) = mpsc::channel(8);
        for i in 0..3u8 {
            let r = Arc::clone(&released);
            let image = CapturedImage::new(vec![i; 20 * 20], 20, 20, PixelFormat::Gray8, i as u64)
                .with_release(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                });
            img_tx.send(image).await.unwrap();
        }
        // too small for a 10×10 grid: counted as a failure, still released
        let r = Arc::clone(&released);
        img_tx
            .send(CapturedImage::new(vec![0u8; 4], 2, 2, PixelFormat::Gray8, 9).with_release(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        drop(img_tx);

        let sampler = FrameSampler::new(FrameFormat::REFERENCE, SampleMode::Downsample);
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(8);
        let stats = run_capture(&mut img_rx, &sampler, &frame_tx).await;

        assert_eq!(stats.images(), 4);
        assert_eq!(stats.sampled(), 3);
        assert_eq!(stats.failed(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 4);

        for i in 0..3u8 {
            let frame = frame_rx.recv().await.unwrap();
            assert_eq!(frame.data().len(), 100);
            assert!(frame.data().iter().all(|&b| b == i));
        }
    }
}
