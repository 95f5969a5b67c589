#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use visual_matcher::{FeatureExtractor, Result};

/// Side of the colour grid; embeddings have `GRID * GRID * 3` values.
pub const GRID: u32 = 2;

/// Deterministic stand-in for the CNN: mean colour of each grid cell.
#[derive(Default)]
pub struct GridColor {
    calls: AtomicUsize,
}

impl GridColor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureExtractor for GridColor {
    fn model(&self) -> &str {
        "grid-color@test"
    }

    fn dimension(&self) -> usize {
        (GRID * GRID * 3) as usize
    }

    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        let mut sums = vec![0.0_f64; self.dimension()];
        let mut counts = vec![0u32; (GRID * GRID) as usize];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let cell = ((y * GRID / h) * GRID + x * GRID / w) as usize;
            counts[cell] += 1;
            for c in 0..3 {
                sums[cell * 3 + c] += f64::from(pixel[c]);
            }
        }
        Ok(sums
            .iter()
            .enumerate()
            .map(|(i, s)| (s / f64::from(counts[i / 3].max(1)) / 255.0 + 0.05) as f32)
            .collect())
    }
}

pub const RED: [u8; 3] = [255, 0, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];

/// An 8x8 image whose left half is `left` and right half is `right`.
pub fn split_image(left: [u8; 3], right: [u8; 3]) -> RgbImage {
    RgbImage::from_fn(8, 8, |x, _| if x < 4 { Rgb(left) } else { Rgb(right) })
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

pub fn write_png(path: &Path, image: &RgbImage) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create image dir");
    }
    image.save(path).expect("save png");
}
