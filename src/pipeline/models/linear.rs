//! Linear text classifier exported as JSON (logistic regression weights).
//!
//! `{ "classes": ["Benign", "Malignant", "Normal"],
//!    "coef": [[...], [...], [...]], "intercept": [...] }`
//!
//! Two classes with a single coefficient row is the binary layout: one
//! decision function, sigmoid for the positive class. Otherwise one row per
//! class with softmax over the decision functions.

use std::path::Path;

use serde::Deserialize;

use super::{read_json_asset, FeatureVector, OracleError, TextClassifier};

#[derive(Debug, Deserialize)]
struct LinearAsset {
    classes: Vec<String>,
    coef: Vec<Vec<f32>>,
    intercept: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct LinearTextClassifier {
    classes: Vec<String>,
    coef: Vec<Vec<f32>>,
    intercept: Vec<f32>,
    dim: usize,
}

impl LinearTextClassifier {
    pub fn new(classes: Vec<String>, coef: Vec<Vec<f32>>, intercept: Vec<f32>) -> Result<Self, String> {
        if classes.len() < 2 {
            return Err(format!("need at least 2 classes, found {}", classes.len()));
        }
        for (i, class) in classes.iter().enumerate() {
            if class.trim().is_empty() {
                return Err(format!("class {i} has an empty label"));
            }
            if classes[..i].contains(class) {
                return Err(format!("duplicate class {class:?}"));
            }
        }

        let binary = classes.len() == 2 && coef.len() == 1;
        if !binary && coef.len() != classes.len() {
            return Err(format!(
                "{} coefficient rows for {} classes",
                coef.len(),
                classes.len()
            ));
        }
        if intercept.len() != coef.len() {
            return Err(format!(
                "{} intercepts for {} coefficient rows",
                intercept.len(),
                coef.len()
            ));
        }
        let dim = coef.first().map(Vec::len).unwrap_or(0);
        if dim == 0 || coef.iter().any(|row| row.len() != dim) {
            return Err("coefficient rows must be non-empty and equally long".into());
        }

        Ok(Self {
            classes,
            coef,
            intercept,
            dim,
        })
    }

    pub fn load(path: &Path) -> Result<Self, OracleError> {
        let asset: LinearAsset = read_json_asset(path)?;
        let classifier = Self::new(asset.classes, asset.coef, asset.intercept).map_err(|reason| {
            OracleError::InvalidAsset {
                path: path.to_path_buf(),
                reason,
            }
        })?;

        tracing::info!(
            path = %path.display(),
            classes = ?classifier.classes,
            features = classifier.dim,
            "Text classifier loaded"
        );
        Ok(classifier)
    }

    /// Number of features the weights expect.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    fn is_binary(&self) -> bool {
        self.coef.len() == 1
    }

    fn decision(&self, features: &FeatureVector) -> Result<Vec<f32>, OracleError> {
        if features.dim() != self.dim {
            return Err(OracleError::Inference(format!(
                "feature dimension {} does not match classifier dimension {}",
                features.dim(),
                self.dim
            )));
        }
        Ok(self
            .coef
            .iter()
            .zip(&self.intercept)
            .map(|(row, b)| features.dot(row) + b)
            .collect())
    }

    fn probabilities(&self, features: &FeatureVector) -> Result<Vec<f32>, OracleError> {
        let scores = self.decision(features)?;
        if self.is_binary() {
            let p = sigmoid(scores[0]);
            return Ok(vec![1.0 - p, p]);
        }
        Ok(softmax(&scores))
    }
}

impl TextClassifier for LinearTextClassifier {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict(&self, features: &FeatureVector) -> Result<String, OracleError> {
        let scores = self.decision(features)?;
        let index = if self.is_binary() {
            usize::from(scores[0] > 0.0)
        } else {
            argmax(&scores)
        };
        Ok(self.classes[index].clone())
    }

    fn predict_proba(&self, features: &[FeatureVector]) -> Result<Vec<Vec<f32>>, OracleError> {
        features.iter().map(|f| self.probabilities(f)).collect()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// First index of the maximum. Ties resolve to the lowest index.
fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}
