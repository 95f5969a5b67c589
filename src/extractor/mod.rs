//! Image feature extraction.
//!
//! A pretrained classification backbone with its head removed maps an RGB image
//! to a fixed-length embedding. Catalog images and query images go through the
//! exact same [`preprocess`] call and the same [`FeatureExtractor`] instance
//! type, so vectors produced offline and online live in the same space.

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub mod runtime;

#[cfg(feature = "onnx")]
pub use onnx::OnnxExtractor;

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::{MatcherError, Result};

/// Canonical input resolution of the MobileNetV2 backbone.
pub const MOBILENET_INPUT_SIZE: u32 = 224;

/// Pooled channel count of the MobileNetV2 backbone.
pub const MOBILENET_DIMS: usize = 1280;

/// Memory layout of the image tensor fed to (and of feature maps read from) the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[batch, height, width, channels]`, the Keras export default.
    #[default]
    Nhwc,
    /// `[batch, channels, height, width]`.
    Nchw,
}

impl TensorLayout {
    pub fn as_str(self) -> &'static str {
        match self {
            TensorLayout::Nhwc => "nhwc",
            TensorLayout::Nchw => "nchw",
        }
    }
}

impl std::str::FromStr for TensorLayout {
    type Err = MatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Ok(TensorLayout::Nhwc),
            "nchw" => Ok(TensorLayout::Nchw),
            other => Err(MatcherError::config(format!(
                "unknown tensor layout '{other}' (expected nhwc or nchw)"
            ))),
        }
    }
}

/// Settings shared by batch and online extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// ONNX export of the backbone (no classification head).
    pub model_path: PathBuf,
    /// Square resolution images are resized to.
    pub input_size: u32,
    pub layout: TensorLayout,
    /// Intra-op threads for the inference session.
    pub intra_threads: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/mobilenet_v2.onnx"),
            input_size: MOBILENET_INPUT_SIZE,
            layout: TensorLayout::Nhwc,
            intra_threads: 4,
        }
    }
}

/// Maps images to fixed-length embeddings.
///
/// Implementations must be deterministic for a given input and safe to call
/// from several request threads at once.
pub trait FeatureExtractor: Send + Sync {
    /// Identity of the weights and preprocessing; persisted with the artifacts.
    fn model(&self) -> &str;

    /// Length of every vector returned by [`FeatureExtractor::extract`].
    fn dimension(&self) -> usize;

    /// Embed a decoded image.
    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>>;

    /// Decode raw image bytes (format sniffed from content) and embed them.
    fn extract_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let image = decode_image_bytes(bytes)?;
        self.extract(&image)
    }

    /// Decode an image file (format sniffed from content) and embed it.
    fn extract_file(&self, path: &Path) -> Result<Vec<f32>> {
        let image = decode_image_file(path)?;
        self.extract(&image)
    }
}

/// Decode image bytes of any enabled format.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(MatcherError::ImageDecode {
            path: None,
            cause: "empty image payload".into(),
        });
    }
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| MatcherError::ImageDecode {
            path: None,
            cause: e.to_string(),
        })?
        .decode()
        .map_err(|e| MatcherError::ImageDecode {
            path: None,
            cause: e.to_string(),
        })
}

/// Decode an image file of any enabled format.
pub fn decode_image_file(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| MatcherError::io(e, path))?
        .with_guessed_format()
        .map_err(|e| MatcherError::io(e, path))?
        .decode()
        .map_err(|e| MatcherError::ImageDecode {
            path: Some(path.to_path_buf()),
            cause: e.to_string(),
        })
}

/// Resize to `size`×`size`, convert to RGB and scale pixels to [-1, 1]
/// (`x / 127.5 - 1`, the MobileNetV2 training normalization).
#[must_use]
pub fn preprocess(image: &DynamicImage, size: u32, layout: TensorLayout) -> Array4<f32> {
    let rgb = image
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();
    let side = size as usize;

    let mut array = match layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, side, side, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, side, side)),
    };

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 127.5 - 1.0;
            match layout {
                TensorLayout::Nhwc => array[[0, y, x, c]] = value,
                TensorLayout::Nchw => array[[0, c, y, x]] = value,
            }
        }
    }

    array
}

/// Reduce raw network output to one embedding.
///
/// Rank-2 `[1, C]` outputs are already pooled. Rank-4 feature maps are
/// averaged over their spatial axes according to `layout`.
pub fn pool_output(shape: &[i64], data: &[f32], layout: TensorLayout) -> Result<Vec<f32>> {
    let dims: Vec<usize> = shape
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| MatcherError::Extraction {
            cause: format!("dynamic or negative output shape {shape:?}"),
        })?;

    let expected: usize = dims.iter().product();
    if expected != data.len() {
        return Err(MatcherError::Extraction {
            cause: format!(
                "output shape {dims:?} implies {expected} values, got {}",
                data.len()
            ),
        });
    }

    match dims.as_slice() {
        [1, _] => Ok(data.to_vec()),
        [1, a, b, c] => {
            let (channels, spatial) = match layout {
                TensorLayout::Nhwc => (*c, a * b),
                TensorLayout::Nchw => (*a, b * c),
            };
            if spatial == 0 || channels == 0 {
                return Err(MatcherError::Extraction {
                    cause: format!("degenerate feature map {dims:?}"),
                });
            }
            let mut pooled = vec![0.0_f32; channels];
            match layout {
                TensorLayout::Nhwc => {
                    for cell in data.chunks_exact(channels) {
                        for (acc, v) in pooled.iter_mut().zip(cell) {
                            *acc += v;
                        }
                    }
                }
                TensorLayout::Nchw => {
                    for (acc, plane) in pooled.iter_mut().zip(data.chunks_exact(spatial)) {
                        *acc = plane.iter().sum();
                    }
                }
            }
            let scale = 1.0 / spatial as f32;
            for v in &mut pooled {
                *v *= scale;
            }
            Ok(pooled)
        }
        [batch, ..] if *batch != 1 => Err(MatcherError::Extraction {
            cause: format!("batch size must be 1, got {batch}"),
        }),
        other => Err(MatcherError::Extraction {
            cause: format!("unexpected output shape {other:?}"),
        }),
    }
}

/// Reject vectors that would poison similarity scores.
pub(crate) fn check_embedding(embedding: &[f32], expected_dims: usize) -> Result<()> {
    if embedding.len() != expected_dims {
        return Err(MatcherError::Extraction {
            cause: format!(
                "embedding has {} dimensions, expected {expected_dims}",
                embedding.len()
            ),
        });
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(MatcherError::Extraction {
            cause: "embedding contains non-finite values".into(),
        });
    }
    Ok(())
}
