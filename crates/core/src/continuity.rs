//! Continuity guidance derived from the previously accepted frame.
//!
//! Two auxiliary maps bias the next generation toward the layout and
//! tonal structure of the frame before it:
//!
//! - an edge map (Sobel gradient magnitude, thresholded), and
//! - a coarse depth proxy (heavily blurred, contrast-stretched luminance;
//!   brighter is treated as nearer).
//!
//! Both maps are produced at the generation resolution so backends can
//! consume them without further resizing.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};

use crate::error::CoreError;

/// Gradient magnitude below which a pixel is not an edge.
pub const EDGE_THRESHOLD: f32 = 48.0;

/// Gaussian sigma, relative to the shorter image side, for the depth proxy.
pub const DEPTH_BLUR_FRACTION: f32 = 0.02;

/// Guidance artifacts for one generation.
#[derive(Debug, Clone)]
pub struct ContinuityGuide {
    pub edge_map: GrayImage,
    pub depth_map: GrayImage,
}

impl ContinuityGuide {
    /// Derive guidance from `previous`, resized to `width` x `height`.
    pub fn from_image(previous: &DynamicImage, width: u32, height: u32) -> Result<Self, CoreError> {
        if width == 0 || height == 0 {
            return Err(CoreError::Validation(
                "continuity guide dimensions must be non-zero".to_string(),
            ));
        }
        let gray = previous
            .resize_exact(width, height, FilterType::Triangle)
            .to_luma8();

        Ok(Self {
            edge_map: edge_map(&gray),
            depth_map: depth_map(&gray),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.edge_map.dimensions()
    }

    pub fn edge_png(&self) -> Result<Vec<u8>, CoreError> {
        encode_png(&self.edge_map)
    }

    pub fn depth_png(&self) -> Result<Vec<u8>, CoreError> {
        encode_png(&self.depth_map)
    }
}

/// Binary edge map from the Sobel gradient magnitude.
pub fn edge_map(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut out = GrayImage::new(w, h);
    if w < 3 || h < 3 {
        return out;
    }

    let px = |x: u32, y: u32| f32::from(gray.get_pixel(x, y)[0]);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2.0 * px(x - 1, y)
                - px(x - 1, y + 1);
            let gy = px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2.0 * px(x, y - 1)
                - px(x + 1, y - 1);
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude >= EDGE_THRESHOLD {
                out.put_pixel(x, y, Luma([255]));
            }
        }
    }
    out
}

/// Blurred, contrast-stretched luminance as a stand-in for depth.
pub fn depth_map(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let sigma = (w.min(h) as f32 * DEPTH_BLUR_FRACTION).max(1.0);
    let mut blurred = imageops::blur(gray, sigma);

    let (lo, hi) = blurred
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if hi > lo {
        let range = f32::from(hi - lo);
        for p in blurred.pixels_mut() {
            let v = f32::from(p[0] - lo) / range * 255.0;
            p[0] = v.round() as u8;
        }
    }
    blurred
}

fn encode_png(img: &GrayImage) -> Result<Vec<u8>, CoreError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img.clone()).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
