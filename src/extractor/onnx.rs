use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use image::DynamicImage;
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{ExtractorConfig, FeatureExtractor, TensorLayout, check_embedding, pool_output, preprocess};
use crate::{MatcherError, Result};

/// MobileNetV2-style backbone served by ONNX Runtime.
///
/// The session sits behind a mutex: concurrent callers are serialized on the
/// forward pass while decoding and preprocessing run in parallel.
pub struct OnnxExtractor {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    model_id: String,
    dimension: usize,
    input_size: u32,
    layout: TensorLayout,
    model_path: PathBuf,
}

impl OnnxExtractor {
    /// Load the model, then run one probe inference to learn the output width.
    pub fn load(config: &ExtractorConfig) -> Result<Self> {
        let model_path = config.model_path.clone();
        if !model_path.exists() {
            return Err(MatcherError::ModelLoad {
                path: model_path,
                cause: "model file not found".into(),
            });
        }
        super::runtime::configure_runtime();

        let started = Instant::now();
        let model_id = fingerprint(&model_path, config.input_size, config.layout)?;
        tracing::debug!(path = %model_path.display(), model = %model_id, "loading feature extractor");

        let session = Session::builder()
            .map_err(|e| model_error(&model_path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| model_error(&model_path, e))?
            .with_intra_threads(config.intra_threads.max(1))
            .map_err(|e| model_error(&model_path, e))?
            .commit_from_file(&model_path)
            .map_err(|e| model_error(&model_path, e))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| MatcherError::ModelLoad {
                path: model_path.clone(),
                cause: "model declares no inputs".into(),
            })?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| MatcherError::ModelLoad {
                path: model_path.clone(),
                cause: "model declares no outputs".into(),
            })?;

        let mut extractor = Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            model_id,
            dimension: 0,
            input_size: config.input_size,
            layout: config.layout,
            model_path,
        };

        let probe = DynamicImage::new_rgb8(config.input_size, config.input_size);
        let probe_tensor = preprocess(&probe, extractor.input_size, extractor.layout);
        let probe_embedding = extractor.run(probe_tensor)?;
        extractor.dimension = probe_embedding.len();

        tracing::info!(
            model = %extractor.model_id,
            dims = extractor.dimension,
            input = %extractor.input_name,
            output = %extractor.output_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "feature extractor ready"
        );

        Ok(extractor)
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn run(&self, pixel_values: Array4<f32>) -> Result<Vec<f32>> {
        let input_tensor = Tensor::from_array(pixel_values).map_err(|e| MatcherError::Extraction {
            cause: format!("Failed to create input tensor: {e}"),
        })?;

        let mut session = self.session.lock().map_err(|_| MatcherError::Extraction {
            cause: "inference session lock poisoned".into(),
        })?;

        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .map_err(|e| MatcherError::Extraction {
                cause: format!("Inference failed: {e}"),
            })?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| MatcherError::Extraction {
                cause: format!("No output '{}' from model", self.output_name),
            })?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| MatcherError::Extraction {
                cause: format!("Failed to extract features: {e}"),
            })?;
        let dims: Vec<i64> = (0..shape.len()).map(|i| shape[i]).collect();

        pool_output(&dims, data, self.layout)
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn model(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let pixel_values = preprocess(image, self.input_size, self.layout);
        let embedding = self.run(pixel_values)?;
        check_embedding(&embedding, self.dimension)?;
        tracing::trace!(dims = embedding.len(), "extracted image features");
        Ok(embedding)
    }
}

fn model_error(path: &Path, err: impl std::fmt::Display) -> MatcherError {
    MatcherError::ModelLoad {
        path: path.to_path_buf(),
        cause: err.to_string(),
    }
}

/// `<file stem>@<16 hex chars of blake3(model bytes)>:<input size>:<layout>`.
///
/// Catalog rows are only comparable with queries preprocessed the same way,
/// so resolution and layout are part of the identity.
fn fingerprint(path: &Path, input_size: u32, layout: TensorLayout) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| MatcherError::io(e, path))?;
    let digest = blake3::hash(&bytes).to_hex();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    Ok(format!("{stem}@{}:{input_size}:{}", &digest[..16], layout.as_str()))
}
