//! CT label map: ordinal score index → diagnosis label.
//!
//! The order is a contract with the trained model and ships in a JSON file
//! next to the model weights (`ct_labels.json`). A mismatch silently swaps
//! diagnoses, so there is no run-time fallback: the file must load and
//! validate or the service does not start.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{read_json_asset, OracleError};

/// Number of classes the CT model scores.
pub const CT_CLASS_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LabelFile {
    /// Model artifact this order was exported with.
    #[serde(default)]
    model: Option<String>,
    labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CtLabelMap {
    labels: Vec<String>,
    model: Option<String>,
}

impl CtLabelMap {
    /// Validate an ordered label list.
    pub fn new(labels: Vec<String>) -> Result<Self, String> {
        if labels.len() != CT_CLASS_COUNT {
            return Err(format!(
                "expected {CT_CLASS_COUNT} labels, found {}",
                labels.len()
            ));
        }
        if labels.iter().any(|l| l.trim().is_empty()) {
            return Err("labels must be non-empty".into());
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(format!("duplicate label {label:?}"));
            }
        }
        Ok(Self {
            labels,
            model: None,
        })
    }

    /// Training-time order of the reference lung CT model.
    pub fn reference() -> Self {
        Self {
            labels: vec!["Benign".into(), "Malignant".into(), "Normal".into()],
            model: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, OracleError> {
        let file: LabelFile = read_json_asset(path)?;
        let mut map = Self::new(file.labels).map_err(|reason| OracleError::InvalidAsset {
            path: path.to_path_buf(),
            reason,
        })?;
        map.model = file.model;

        tracing::info!(
            path = %path.display(),
            model = ?map.model,
            labels = ?map.labels,
            "CT label map loaded"
        );
        Ok(map)
    }

    pub fn label_for(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Model file name recorded alongside the labels, if any.
    pub fn model_file(&self) -> Option<&str> {
        self.model.as_deref()
    }
}
