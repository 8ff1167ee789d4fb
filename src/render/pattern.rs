use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};

use crate::error::RenderError;

use super::{Frame, FrameSource, FrameSourceKind, RenderTarget};

const SHADES: [u8; 5] = [0, 64, 128, 192, 255];
const BORDER: u32 = 2;
const CHECKER_CELL: u32 = 8;
const COUNTER_BITS: u32 = 16;

/// Built-in test pattern: shade bars, a checkerboard, a border and a binary
/// render counter so consecutive frames differ in a small region.
#[derive(Debug)]
pub struct PatternSource {
    width: u32,
    height: u32,
    renders: AtomicU32,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            renders: AtomicU32::new(0),
        }
    }

    pub fn draw(width: u32, height: u32, counter: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([255]));
        let bars_bottom = height / 2;
        let bar_width = (width / SHADES.len() as u32).max(1);

        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let shade = if x < BORDER || y < BORDER || x + BORDER >= width || y + BORDER >= height {
                0
            } else if y < bars_bottom {
                let index = ((x / bar_width) as usize).min(SHADES.len() - 1);
                SHADES[index]
            } else if x < width / 2 {
                if ((x / CHECKER_CELL) + (y / CHECKER_CELL)) % 2 == 0 {
                    0
                } else {
                    255
                }
            } else {
                255
            };
            *pixel = Luma([shade]);
        }

        // counter strip, most significant bit first
        let strip_left = width / 2 + BORDER * 2;
        let strip_width = width.saturating_sub(strip_left + BORDER * 2);
        let cell = (strip_width / COUNTER_BITS).max(1);
        let top = bars_bottom + BORDER * 2;
        let bottom = (top + cell * 2).min(height.saturating_sub(BORDER));
        for bit in 0..COUNTER_BITS {
            if counter & (1 << (COUNTER_BITS - 1 - bit)) == 0 {
                continue;
            }
            let left = strip_left + bit * cell;
            for x in left..(left + cell).min(width.saturating_sub(BORDER)) {
                for y in top..bottom {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
        img
    }

    pub fn renders(&self) -> u32 {
        self.renders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for PatternSource {
    fn kind(&self) -> FrameSourceKind {
        FrameSourceKind::Pattern
    }

    async fn render(&self, _target: &RenderTarget) -> Result<Frame, RenderError> {
        let counter = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
        let img = Self::draw(self.width, self.height, counter);
        Ok(Frame::new(DynamicImage::ImageLuma8(img), FrameSourceKind::Pattern))
    }
}
