//! ONNX Runtime backend for the CT classifier.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::TensorRef;

use super::{CtScanModel, OracleError, CT_CLASS_COUNT};
use crate::pipeline::preprocess::Tensor;

/// CT classifier exported to ONNX: input `[n, 256, 256, 3]` f32, output
/// `[n, 3]` class scores.
///
/// `Session::run` needs `&mut self`; the trait exposes `&self`, hence the Mutex.
pub struct OnnxCtModel {
    session: Mutex<Session>,
}

impl OnnxCtModel {
    pub fn load(model_path: &Path) -> Result<Self, OracleError> {
        if !model_path.exists() {
            return Err(OracleError::AssetNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| OracleError::ModelInit(e.to_string()))?
            .with_intra_threads(2)
            .map_err(|e: ort::Error| OracleError::ModelInit(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e: ort::Error| OracleError::ModelInit(format!("ONNX load failed: {e}")))?;

        tracing::info!(path = %model_path.display(), "ONNX CT model loaded");

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl CtScanModel for OnnxCtModel {
    fn predict(&self, batch: &Tensor) -> Result<Vec<Vec<f32>>, OracleError> {
        let [n, h, w, c] = batch.shape();
        let array = ndarray::Array4::from_shape_vec((n, h, w, c), batch.data().to_vec())
            .map_err(|e| OracleError::Inference(e.to_string()))?;
        let input = TensorRef::from_array_view(&array)
            .map_err(|e| OracleError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| OracleError::Inference("Session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| OracleError::Inference(format!("ONNX inference failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OracleError::MalformedOutput(format!("Output extraction: {e}")))?;

        if shape.len() != 2 || shape[0] as usize != n || shape[1] as usize != CT_CLASS_COUNT {
            return Err(OracleError::MalformedOutput(format!(
                "Unexpected output shape: {shape:?}, expected [{n}, {CT_CLASS_COUNT}]"
            )));
        }

        Ok(data
            .chunks(CT_CLASS_COUNT)
            .map(<[f32]>::to_vec)
            .collect())
    }
}
