use image::GrayImage;

use super::ColorDepth;

/// Floyd–Steinberg error diffusion onto the levels of `depth`.
///
/// Integer arithmetic only, scanning left to right, top to bottom, so the
/// output is a pure function of the input.
pub fn floyd_steinberg(src: &GrayImage, depth: ColorDepth) -> GrayImage {
    let (width, height) = src.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut work: Vec<i32> = src.as_raw().iter().map(|&v| v as i32).collect();
    let mut out = GrayImage::new(width, height);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let old = work[idx].clamp(0, 255);
            let new = depth.quantize(old as u8) as i32;
            out.put_pixel(x as u32, y as u32, image::Luma([new as u8]));

            let err = old - new;
            if err == 0 {
                continue;
            }
            if x + 1 < w {
                work[idx + 1] += err * 7 / 16;
            }
            if y + 1 < h {
                if x > 0 {
                    work[idx + w - 1] += err * 3 / 16;
                }
                work[idx + w] += err * 5 / 16;
                if x + 1 < w {
                    work[idx + w + 1] += err / 16;
                }
            }
        }
    }
    out
}
