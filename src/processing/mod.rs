//! Turns captured frames into display-native images and change signatures.
//!
//! Pipeline: grayscale, rotate, fit-and-letterbox onto a white canvas of the
//! display size (never upscaling), Floyd–Steinberg dither, then compare
//! against the last displayed image.

pub mod dither;
pub mod phash;

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::render::Frame;

use self::phash::{compute_hamming_distance, compute_phash};

const ENABLE_LOGS: bool = false;

use crate::log_debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColorDepth {
    /// Pure black and white.
    Bw,
    /// Sixteen gray levels, the native depth of IT8951 panels.
    Gray16,
}

impl ColorDepth {
    pub fn quantize(self, value: u8) -> u8 {
        match self {
            ColorDepth::Bw => {
                if value >= 128 {
                    255
                } else {
                    0
                }
            }
            ColorDepth::Gray16 => (((value as u16 + 8) / 17) * 17).min(255) as u8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorDepth::Bw => "bw",
            ColorDepth::Gray16 => "gray16",
        }
    }
}

impl FromStr for ColorDepth {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bw" | "1bit" | "mono" => Ok(ColorDepth::Bw),
            "gray16" | "grey16" | "4bit" => Ok(ColorDepth::Gray16),
            other => bail!("unknown EPD mode '{other}'"),
        }
    }
}

impl fmt::Display for ColorDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned pixel rectangle, inclusive of `x`/`y`, exclusive of the far edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// How the new image differs from what is on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameChange {
    /// Nothing comparable on the panel yet; treat the whole frame as changed.
    Initial,
    Region(Region),
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    pixels: GrayImage,
    depth: ColorDepth,
    content_hash: u64,
    phash: String,
}

impl ProcessedImage {
    pub fn new(pixels: GrayImage, depth: ColorDepth) -> Self {
        let content_hash = content_hash(&pixels);
        let phash = compute_phash(&DynamicImage::ImageLuma8(pixels.clone()));
        Self {
            pixels,
            depth,
            content_hash,
            phash,
        }
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn depth(&self) -> ColorDepth {
        self.depth
    }

    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    pub fn crop(&self, region: &Region) -> GrayImage {
        imageops::crop_imm(&self.pixels, region.x, region.y, region.width, region.height).to_image()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySignature {
    pub content_hash: u64,
    pub change: FrameChange,
    /// Partial refreshes since the last full one, counting this cycle.
    pub since_last_full_refresh: u32,
    pub phash: String,
    /// Perceptual distance to the previous image, if any.
    pub phash_distance: Option<u32>,
}

impl DisplaySignature {
    /// Bounds of the changed pixels; the whole surface for an initial frame.
    pub fn changed_region(&self, width: u32, height: u32) -> Option<Region> {
        match self.change {
            FrameChange::Initial => Some(Region::full(width, height)),
            FrameChange::Region(region) => Some(region),
            FrameChange::Unchanged => None,
        }
    }

    pub fn has_prior_frame(&self) -> bool {
        self.change != FrameChange::Initial
    }
}

#[derive(Debug, Clone)]
pub struct FrameProcessor {
    width: u32,
    height: u32,
    rotation: u16,
    depth: ColorDepth,
}

impl FrameProcessor {
    pub fn new(width: u32, height: u32, rotation: u16, depth: ColorDepth) -> Self {
        Self {
            width,
            height,
            rotation: rotation % 360,
            depth,
        }
    }

    pub fn process(
        &self,
        frame: &Frame,
        last_displayed: Option<&ProcessedImage>,
        since_last_full_refresh: u32,
    ) -> (ProcessedImage, DisplaySignature) {
        let gray = frame.image().to_luma8();
        let rotated = rotate(gray, self.rotation);
        let fitted = self.letterbox(&rotated);
        let dithered = dither::floyd_steinberg(&fitted, self.depth);
        let processed = ProcessedImage::new(dithered, self.depth);

        let change = match last_displayed {
            Some(prev) if prev.pixels.dimensions() == processed.pixels.dimensions() => {
                match changed_bounds(&prev.pixels, &processed.pixels) {
                    Some(region) => FrameChange::Region(region),
                    None => FrameChange::Unchanged,
                }
            }
            _ => FrameChange::Initial,
        };
        let phash_distance =
            last_displayed.map(|prev| compute_hamming_distance(&prev.phash, &processed.phash));

        log_debug!(
            "processed {}x{} frame: hash {:016x}, change {:?}, phash distance {:?}",
            frame.width(),
            frame.height(),
            processed.content_hash,
            change,
            phash_distance
        );

        let signature = DisplaySignature {
            content_hash: processed.content_hash,
            change,
            since_last_full_refresh: since_last_full_refresh.saturating_add(1),
            phash: processed.phash.clone(),
            phash_distance,
        };
        (processed, signature)
    }

    /// Scale down (never up) to fit, then center on a white canvas.
    fn letterbox(&self, src: &GrayImage) -> GrayImage {
        let (src_w, src_h) = src.dimensions();
        if (src_w, src_h) == (self.width, self.height) {
            return src.clone();
        }

        let scaled = if src_w > self.width || src_h > self.height {
            let scale = f64::min(
                self.width as f64 / src_w as f64,
                self.height as f64 / src_h as f64,
            );
            let w = ((src_w as f64 * scale).round() as u32).clamp(1, self.width);
            let h = ((src_h as f64 * scale).round() as u32).clamp(1, self.height);
            imageops::resize(src, w, h, FilterType::Lanczos3)
        } else {
            src.clone()
        };

        let mut canvas = GrayImage::from_pixel(self.width, self.height, Luma([255]));
        let left = (self.width - scaled.width()) / 2;
        let top = (self.height - scaled.height()) / 2;
        imageops::replace(&mut canvas, &scaled, left as i64, top as i64);
        canvas
    }
}

fn rotate(img: GrayImage, rotation: u16) -> GrayImage {
    match rotation {
        90 => imageops::rotate90(&img),
        180 => imageops::rotate180(&img),
        270 => imageops::rotate270(&img),
        _ => img,
    }
}

/// FNV-1a over the dimensions and raw pixels.
pub fn content_hash(img: &GrayImage) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let (w, h) = img.dimensions();
    w.to_le_bytes()
        .iter()
        .chain(h.to_le_bytes().iter())
        .chain(img.as_raw().iter())
        .fold(OFFSET, |hash, &byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

fn changed_bounds(prev: &GrayImage, next: &GrayImage) -> Option<Region> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in next.enumerate_pixels() {
        if prev.get_pixel(x, y) == pixel {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| Region {
        x: x0,
        y: y0,
        width: x1 - x0 + 1,
        height: y1 - y0 + 1,
    })
}
