//! Embedding model adapter.
//!
//! The embedding model is an external collaborator reached through the
//! [`EmbeddingProvider`] trait. [`OnnxEmbedder`] is the default provider: it
//! runs an exported face-embedding network via ONNX Runtime on cropped faces.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_INPUT_SIZE: u32 = 160;
const PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid face image: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim vector, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector contains non-finite values")]
    NonFinite,
    #[error("vector norm is zero or too small to normalize")]
    Degenerate,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a fixed-length vector for a cropped face.
///
/// For similarity matching this is the identity embedding; for the closed-set
/// classifier it is the per-class score vector. Implementations must be
/// deterministic for a fixed model.
pub trait EmbeddingProvider {
    /// Length of every vector returned by [`embed`](Self::embed).
    fn dimension(&self) -> usize;

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbeddingError>;
}

/// Memory layout of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, as exported from Keras.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`, as exported from PyTorch.
    Nchw,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nhwc" => Ok(TensorLayout::Nhwc),
            "nchw" => Ok(TensorLayout::Nchw),
            other => Err(format!("unknown tensor layout {other:?} (expected nhwc or nchw)")),
        }
    }
}

/// Options for [`OnnxEmbedder::load`].
#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    /// Side of the square model input; crops are resized to this.
    pub input_size: u32,
    pub layout: TensorLayout,
    /// Expected length of the first output tensor.
    pub output_dim: usize,
}

impl Default for EmbedderOptions {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            layout: TensorLayout::Nhwc,
            output_dim: 128,
        }
    }
}

/// ONNX Runtime embedding provider.
pub struct OnnxEmbedder {
    session: Session,
    options: EmbedderOptions,
}

impl OnnxEmbedder {
    /// Load an ONNX embedding (or classifier) model from the given path.
    pub fn load(model_path: &Path, options: EmbedderOptions) -> Result<Self, EmbeddingError> {
        if !model_path.exists() {
            return Err(EmbeddingError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            input_size = options.input_size,
            layout = ?options.layout,
            output_dim = options.output_dim,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session, options })
    }

    /// Resize a face crop and scale it to [0, 1] in the configured layout.
    fn preprocess(face: &RgbImage, size: u32, layout: TensorLayout) -> Array4<f32> {
        let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
        let s = size as usize;
        let mut tensor = match layout {
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, s, s, 3)),
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, s, s)),
        };

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let v = pixel[c] as f32 / PIXEL_SCALE;
                match layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                }
            }
        }

        tensor
    }
}

impl EmbeddingProvider for OnnxEmbedder {
    fn dimension(&self) -> usize {
        self.options.output_dim
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbeddingError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbeddingError::InvalidInput(format!(
                "empty crop {}x{}",
                face.width(),
                face.height()
            )));
        }

        let input = Self::preprocess(face, self.options.input_size, self.options.layout);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::InferenceFailed(format!("output extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != self.options.output_dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.options.output_dim,
                actual: raw.len(),
            });
        }

        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_nhwc_shape_and_scale() {
        let face = RgbImage::from_pixel(40, 30, Rgb([255, 0, 51]));
        let tensor = OnnxEmbedder::preprocess(&face, 16, TensorLayout::Nhwc);
        assert_eq!(tensor.shape(), &[1, 16, 16, 3]);
        assert!((tensor[[0, 5, 7, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 5, 7, 1]].abs() < 1e-6);
        assert!((tensor[[0, 5, 7, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_nchw_shape() {
        let face = RgbImage::from_pixel(8, 8, Rgb([0, 255, 0]));
        let tensor = OnnxEmbedder::preprocess(&face, 12, TensorLayout::Nchw);
        assert_eq!(tensor.shape(), &[1, 3, 12, 12]);
        assert!((tensor[[0, 1, 11, 11]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 0, 11, 11]].abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load(
            Path::new("/nonexistent/face_embedder.onnx"),
            EmbedderOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EmbeddingError::ModelNotFound(_)));
    }

    #[test]
    fn test_tensor_layout_from_str() {
        assert_eq!("NHWC".parse::<TensorLayout>().unwrap(), TensorLayout::Nhwc);
        assert_eq!("nchw".parse::<TensorLayout>().unwrap(), TensorLayout::Nchw);
        assert!("chw".parse::<TensorLayout>().is_err());
    }
}
