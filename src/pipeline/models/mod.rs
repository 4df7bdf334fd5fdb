//! Pre-trained oracles: CT model, text classifier, fitted vectorizer.
//!
//! All oracles are loaded once at start-up and shared read-only behind
//! `Arc`. Every trait method takes `&self`; implementations that need
//! interior mutability (ONNX sessions) guard it themselves.

pub mod labels;
pub mod linear;
pub mod tfidf;
#[cfg(feature = "onnx-models")]
pub mod onnx;

pub use labels::{CtLabelMap, CT_CLASS_COUNT};
pub use linear::LinearTextClassifier;
pub use tfidf::TfidfVectorizer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::preprocess::Tensor;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Model asset not found: {0}")]
    AssetNotFound(PathBuf),

    #[error("Cannot read model asset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model asset {path}: {reason}")]
    InvalidAsset { path: PathBuf, reason: String },

    #[error("Model initialization failed: {0}")]
    ModelInit(String),

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(String),
}

// ═══════════════════════════════════════════════════════════
// Feature vectors
// ═══════════════════════════════════════════════════════════

/// Sparse row in the text classifier's feature space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureVector {
    dim: usize,
    /// Sorted by index, no duplicates, every index < dim.
    entries: Vec<(usize, f32)>,
}

impl FeatureVector {
    /// Entries outside `dim` are dropped; duplicate indices are summed.
    pub fn new(dim: usize, mut entries: Vec<(usize, f32)>) -> Self {
        entries.retain(|&(i, _)| i < dim);
        entries.sort_by_key(|&(i, _)| i);
        let mut merged: Vec<(usize, f32)> = Vec::with_capacity(entries.len());
        for (i, v) in entries {
            match merged.last_mut() {
                Some(last) if last.0 == i => last.1 += v,
                _ => merged.push((i, v)),
            }
        }
        Self {
            dim,
            entries: merged,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn entries(&self) -> &[(usize, f32)] {
        &self.entries
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    /// Dot product with a dense row of the same dimension.
    pub fn dot(&self, dense: &[f32]) -> f32 {
        self.entries
            .iter()
            .filter_map(|&(i, v)| dense.get(i).map(|w| w * v))
            .sum()
    }
}

// ═══════════════════════════════════════════════════════════
// Oracle traits
// ═══════════════════════════════════════════════════════════

/// Image classifier over `[n, 256, 256, 3]` tensors.
///
/// Returns one score row per batch item. The ordinal meaning of each score
/// is fixed at training time and described by `CtLabelMap`.
pub trait CtScanModel: Send + Sync {
    fn predict(&self, batch: &Tensor) -> Result<Vec<Vec<f32>>, OracleError>;
}

/// Fitted text vectorizer. Vocabulary is frozen at load time.
pub trait TextVectorizer: Send + Sync {
    fn transform(&self, text: &str) -> FeatureVector;

    fn dimension(&self) -> usize;
}

/// Text classifier returning labels directly.
pub trait TextClassifier: Send + Sync {
    fn classes(&self) -> &[String];

    fn predict(&self, features: &FeatureVector) -> Result<String, OracleError>;

    /// One probability row per input, columns ordered as `classes()`.
    fn predict_proba(&self, features: &[FeatureVector]) -> Result<Vec<Vec<f32>>, OracleError>;
}

/// Read and deserialize a JSON model asset.
pub fn read_json_asset<T: DeserializeOwned>(path: &Path) -> Result<T, OracleError> {
    if !path.exists() {
        return Err(OracleError::AssetNotFound(path.to_path_buf()));
    }
    let raw = std::fs::read(path).map_err(|source| OracleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|e| OracleError::InvalidAsset {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Load the CT model with whichever backend this build carries.
pub fn load_ct_model(path: &Path) -> Result<Arc<dyn CtScanModel>, OracleError> {
    #[cfg(feature = "onnx-models")]
    {
        Ok(Arc::new(onnx::OnnxCtModel::load(path)?))
    }
    #[cfg(not(feature = "onnx-models"))]
    {
        Err(OracleError::BackendUnavailable(format!(
            "cannot load {}: built without the `onnx-models` feature",
            path.display()
        )))
    }
}

// ═══════════════════════════════════════════════════════════
// Mock implementations (testing)
// ═══════════════════════════════════════════════════════════

type Scorer = Box<dyn Fn(&[f32]) -> Vec<f32> + Send + Sync>;

/// Mock CT model. Scores each batch item with a closure and counts calls.
pub struct MockCtModel {
    scorer: Scorer,
    /// Calls allowed to succeed before failing. `None` = never fails.
    succeed_calls: Option<usize>,
    calls: AtomicUsize,
}

impl MockCtModel {
    /// Same scores for every item.
    pub fn fixed(scores: Vec<f32>) -> Self {
        Self::from_fn(move |_| scores.clone())
    }

    pub fn from_fn(scorer: impl Fn(&[f32]) -> Vec<f32> + Send + Sync + 'static) -> Self {
        Self {
            scorer: Box::new(scorer),
            succeed_calls: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::fixed(vec![]).failing_after(0)
    }

    /// First `n` calls succeed, later calls fail. With `n = 1` inference
    /// succeeds and the explainer's calls fail.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.succeed_calls = Some(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CtScanModel for MockCtModel {
    fn predict(&self, batch: &Tensor) -> Result<Vec<Vec<f32>>, OracleError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.succeed_calls {
            if call >= limit {
                return Err(OracleError::Inference("Mock CT model failure".into()));
            }
        }
        Ok((0..batch.batch_size())
            .filter_map(|i| batch.item(i))
            .map(|item| (self.scorer)(item))
            .collect())
    }
}

/// Mock text classifier with a fixed label and uniform probabilities.
pub struct MockTextClassifier {
    classes: Vec<String>,
    label: String,
    fail_proba: bool,
}

impl MockTextClassifier {
    pub fn new(classes: &[&str], label: &str) -> Self {
        Self {
            classes: classes.iter().map(|c| c.to_string()).collect(),
            label: label.to_string(),
            fail_proba: false,
        }
    }

    /// `predict` works, `predict_proba` (explainer only) fails.
    pub fn failing_proba(mut self) -> Self {
        self.fail_proba = true;
        self
    }
}

impl TextClassifier for MockTextClassifier {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict(&self, _features: &FeatureVector) -> Result<String, OracleError> {
        Ok(self.label.clone())
    }

    fn predict_proba(&self, features: &[FeatureVector]) -> Result<Vec<Vec<f32>>, OracleError> {
        if self.fail_proba {
            return Err(OracleError::Inference("Mock predict_proba failure".into()));
        }
        let n = self.classes.len().max(1);
        Ok(vec![vec![1.0 / n as f32; n]; features.len()])
    }
}
