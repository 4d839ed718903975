use camstream_core::{CaptureError, Frame, FrameFormat, SampleMode};

use crate::CapturedImage;

/// Reduces a camera image to a `FrameFormat` sample grid.
///
/// Channel mapping per sample:
/// - 1 channel: the blue byte (low byte of a packed ARGB pixel)
/// - 3 channels: R, G, B
/// - 4 channels: R, G, B, A
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    format: FrameFormat,
    mode: SampleMode,
}

impl FrameSampler {
    pub fn new(format: FrameFormat, mode: SampleMode) -> Self {
        Self { format, mode }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn sample(&self, image: &CapturedImage) -> Result<Frame, CaptureError> {
        let grid = self.format;
        let channels = grid.channels as usize;
        if !matches!(channels, 1 | 3 | 4) {
            return Err(CaptureError::UnsupportedChannels(grid.channels));
        }
        if image.width < grid.width || image.height < grid.height {
            return Err(CaptureError::ImageTooSmall {
                width: image.width,
                height: image.height,
                grid: grid.to_string(),
            });
        }
        let needed = image.width as usize * image.height as usize * image.format.bytes_per_pixel();
        if image.data.len() < needed {
            return Err(CaptureError::ShortBuffer {
                width: image.width,
                height: image.height,
                format: image.format.to_string(),
                got: image.data.len(),
            });
        }

        let mut out = Vec::with_capacity(grid.frame_len());
        for gy in 0..grid.height {
            for gx in 0..grid.width {
                let (sx, sy) = self.source_coords(gx, gy, image.width, image.height);
                // bounds checked above
                let px = image.pixel(sx, sy).unwrap_or(&[0u8; 4]);
                let [r, g, b, a] = image.format.rgba(px);
                match channels {
                    1 => out.push(b),
                    3 => out.extend_from_slice(&[r, g, b]),
                    _ => out.extend_from_slice(&[r, g, b, a]),
                }
            }
        }

        Frame::new(grid, out).map_err(|_| CaptureError::UnsupportedChannels(grid.channels))
    }

    /// Image coordinates of the pixel that represents grid cell (gx, gy).
    fn source_coords(&self, gx: u32, gy: u32, width: u32, height: u32) -> (u32, u32) {
        match self.mode {
            SampleMode::Crop => (gx, gy),
            SampleMode::Downsample => {
                // centre of the cell, nearest neighbour
                let sx = ((2 * gx as u64 + 1) * width as u64) / (2 * self.format.width as u64);
                let sy = ((2 * gy as u64 + 1) * height as u64) / (2 * self.format.height as u64);
                ((sx as u32).min(width - 1), (sy as u32).min(height - 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;

    /// 20×20 RGBA image where each pixel is (x, y, x + y, 255).
    fn coordinate_image() -> CapturedImage {
        let mut data = Vec::with_capacity(20 * 20 * 4);
        for y in 0..20u8 {
            for x in 0..20u8 {
                data.extend_from_slice(&[x, y, x + y, 255]);
            }
        }
        CapturedImage::new(data, 20, 20, PixelFormat::Rgba8, 0)
    }

    #[test]
    fn reference_grid_is_one_blue_byte_per_sample() {
        let sampler = FrameSampler::new(FrameFormat::REFERENCE, SampleMode::Downsample);
        let frame = sampler.sample(&coordinate_image()).unwrap();
        assert_eq!(frame.data().len(), 100);
        // cell (0,0) covers pixels 0..2, centre pixel is (1,1)
        assert_eq!(frame.sample(0, 0), Some(&[2u8][..]));
        // cell (9,9) centre pixel is (19,19)
        assert_eq!(frame.sample(9, 9), Some(&[38u8][..]));
    }

    #[test]
    fn crop_takes_the_top_left_block() {
        let sampler = FrameSampler::new(FrameFormat::new(10, 10, 3), SampleMode::Crop);
        let frame = sampler.sample(&coordinate_image()).unwrap();
        assert_eq!(frame.data().len(), 300);
        assert_eq!(frame.sample(3, 4), Some(&[3u8, 4, 7][..]));
    }

    #[test]
    fn rgba_channels_include_alpha() {
        let sampler = FrameSampler::new(FrameFormat::new(2, 2, 4), SampleMode::Downsample);
        let frame = sampler.sample(&coordinate_image()).unwrap();
        assert_eq!(frame.sample(1, 1), Some(&[15u8, 15, 30, 255][..]));
    }

    #[test]
    fn bgrx_blue_channel_is_first_byte() {
        let image = CapturedImage::new(vec![9u8, 1, 2, 0].repeat(100), 10, 10, PixelFormat::Bgrx8, 0);
        let sampler = FrameSampler::new(FrameFormat::REFERENCE, SampleMode::Crop);
        let frame = sampler.sample(&image).unwrap();
        assert!(frame.data().iter().all(|&b| b == 9));
    }

    #[test]
    fn rejects_small_images_and_short_buffers() {
        let sampler = FrameSampler::new(FrameFormat::REFERENCE, SampleMode::Downsample);

        let small = CapturedImage::new(vec![0u8; 64], 8, 8, PixelFormat::Gray8, 0);
        assert!(matches!(sampler.sample(&small), Err(CaptureError::ImageTooSmall { .. })));

        let short = CapturedImage::new(vec![0u8; 10], 10, 10, PixelFormat::Gray8, 0);
        assert!(matches!(sampler.sample(&short), Err(CaptureError::ShortBuffer { got: 10, .. })));
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        let sampler = FrameSampler::new(FrameFormat::new(10, 10, 2), SampleMode::Crop);
        assert_eq!(
            sampler.sample(&coordinate_image()).unwrap_err(),
            CaptureError::UnsupportedChannels(2)
        );
    }
}
