use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::{CapturedImage, FrameSource, PixelFormat};

/// Moving RGBA test pattern at a fixed rate. Stands in for a camera.
///
/// Pixel (x, y) of image `t` is `(x·255/w, y·255/h, (x + y + t) mod 256, 255)`.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    ticker: Interval,
    tick: u64,
    limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        let period = Duration::from_micros(1_000_000 / fps.max(1) as u64);
        let mut ticker = interval(period);
        // a slow consumer of images should see fresh ones, not a burst of stale ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { width: width.max(1), height: height.max(1), ticker, tick: 0, limit: None }
    }

    /// End the source after `frames` images.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Render image number `t` without waiting.
    pub fn render(&self, t: u64) -> CapturedImage {
        let (w, h) = (self.width, self.height);
        let (wd, hd) = ((w - 1).max(1), (h - 1).max(1));
        let mut data = Vec::with_capacity(w as usize * h as usize * 4);
        for y in 0..h {
            for x in 0..w {
                let r = (x * 255 / wd).min(255) as u8;
                let g = (y * 255 / hd).min(255) as u8;
                let b = ((x as u64 + y as u64 + t) % 256) as u8;
                data.extend_from_slice(&[r, g, b, 0xff]);
            }
        }
        let pts_ms = t * self.ticker.period().as_millis() as u64;
        CapturedImage::new(data, w, h, PixelFormat::Rgba8, pts_ms)
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_image(&mut self) -> Option<CapturedImage> {
        if self.limit.is_some_and(|limit| self.tick >= limit) {
            return None;
        }
        self.ticker.tick().await;
        let image = self.render(self.tick);
        self.tick += 1;
        Some(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_limited_rgba_images() {
        let mut source = SyntheticSource::new(16, 12, 200).with_limit(3);
        let mut count = 0;
        while let Some(image) = source.next_image().await {
            assert_eq!((image.width, image.height), (16, 12));
            assert_eq!(image.format, PixelFormat::Rgba8);
            assert_eq!(image.data.len(), 16 * 12 * 4);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn pattern_moves_between_images() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        let _guard = rt.enter();
        let source = SyntheticSource::new(4, 4, 30);
        let a = source.render(0);
        let b = source.render(1);
        assert_eq!(a.pixel(0, 0), Some(&[0u8, 0, 0, 0xff][..]));
        assert_eq!(b.pixel(0, 0), Some(&[0u8, 0, 1, 0xff][..]));
        assert_eq!(a.pixel(3, 3), Some(&[255u8, 255, 6, 0xff][..]));
    }
}
