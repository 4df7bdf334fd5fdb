//! Token-removal explainer for the text classifier.
//!
//! Distinct `\W+`-separated words are the features. Sample 0 is the full
//! text; every other sample removes all occurrences of a uniformly sized
//! random set of words. Perturbed strings go through the shared vectorizer
//! and the classifier's `predict_proba`, then a local surrogate over the
//! predicted class ranks the words.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use rand::seq::index::sample;
use rand::Rng;
use regex::Regex;

use super::surrogate::{cosine_distance_to_original, explain_instance, exponential_kernel};
use super::{make_rng, ExplainerConfig};
use crate::pipeline::models::{TextClassifier, TextVectorizer};
use crate::pipeline::types::{Prediction, TokenWeight};
use crate::pipeline::PipelineError;

/// Cosine distances are scaled by this before the kernel.
const DISTANCE_SCALE: f64 = 100.0;

static WORD_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W+").unwrap());

/// Text split into alternating word and separator pieces, with the distinct
/// words indexed in order of first appearance.
#[derive(Debug, Clone)]
pub struct IndexedText {
    /// `(piece, word index)`; separators carry `None`.
    pieces: Vec<(String, Option<usize>)>,
    vocab: Vec<String>,
}

impl IndexedText {
    pub fn new(text: &str) -> Self {
        let mut pieces = Vec::new();
        let mut vocab: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut push_word = |word: &str, pieces: &mut Vec<(String, Option<usize>)>| {
            if word.is_empty() {
                return;
            }
            let id = *index.entry(word.to_string()).or_insert_with(|| {
                vocab.push(word.to_string());
                vocab.len() - 1
            });
            pieces.push((word.to_string(), Some(id)));
        };

        let mut last = 0;
        for sep in WORD_SEPARATOR.find_iter(text) {
            push_word(&text[last..sep.start()], &mut pieces);
            pieces.push((sep.as_str().to_string(), None));
            last = sep.end();
        }
        push_word(&text[last..], &mut pieces);

        Self { pieces, vocab }
    }

    pub fn num_words(&self) -> usize {
        self.vocab.len()
    }

    pub fn word(&self, id: usize) -> &str {
        &self.vocab[id]
    }

    /// Pieces in original order; words carry `true`.
    pub fn pieces(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.pieces.iter().map(|(p, id)| (p.as_str(), id.is_some()))
    }

    /// Rebuild the text keeping only words whose flag is set.
    pub fn with_words(&self, keep: &[bool]) -> String {
        self.pieces
            .iter()
            .filter(|(_, id)| id.map_or(true, |i| keep[i]))
            .map(|(piece, _)| piece.as_str())
            .collect()
    }
}

pub struct TextExplainer {
    vectorizer: Arc<dyn TextVectorizer>,
    classifier: Arc<dyn TextClassifier>,
    config: ExplainerConfig,
}

impl TextExplainer {
    pub fn new(
        vectorizer: Arc<dyn TextVectorizer>,
        classifier: Arc<dyn TextClassifier>,
        config: ExplainerConfig,
    ) -> Self {
        Self {
            vectorizer,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> &ExplainerConfig {
        &self.config
    }

    pub fn explain(&self, text: &str, prediction: &Prediction) -> Result<Vec<TokenWeight>, PipelineError> {
        let indexed = IndexedText::new(text);
        let d = indexed.num_words();
        if d == 0 {
            return Err(unavailable("no words to explain"));
        }
        let class = self
            .classifier
            .classes()
            .iter()
            .position(|c| c == prediction.label())
            .ok_or_else(|| unavailable(format!("label {:?} not among classifier classes", prediction.label())))?;

        let mut rng = make_rng(self.config.seed);
        let num_samples = self.config.num_samples.max(1);
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(num_samples);
        let mut docs: Vec<String> = Vec::with_capacity(num_samples);
        rows.push(vec![1.0; d]);
        docs.push(indexed.with_words(&vec![true; d]));
        for _ in 1..num_samples {
            let remove = rng.gen_range(1..=d);
            let mut keep = vec![true; d];
            for i in sample(&mut rng, d, remove).into_iter() {
                keep[i] = false;
            }
            rows.push(keep.iter().map(|&k| if k { 1.0 } else { 0.0 }).collect());
            docs.push(indexed.with_words(&keep));
        }

        let features: Vec<_> = docs.iter().map(|doc| self.vectorizer.transform(doc)).collect();
        let proba = self
            .classifier
            .predict_proba(&features)
            .map_err(|e| unavailable(format!("classifier query failed: {e}")))?;
        if proba.len() != rows.len() {
            return Err(unavailable(format!(
                "classifier returned {} rows for {} samples",
                proba.len(),
                rows.len()
            )));
        }
        let targets = proba
            .iter()
            .map(|row| match row.get(class) {
                Some(p) if p.is_finite() => Ok(f64::from(*p)),
                _ => Err(unavailable(format!("malformed probability row {row:?}"))),
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let weights: Vec<f64> = rows
            .iter()
            .map(|r| {
                exponential_kernel(
                    cosine_distance_to_original(r) * DISTANCE_SCALE,
                    self.config.kernel_width,
                )
            })
            .collect();

        let local = explain_instance(&rows, &targets, &weights, self.config.num_features)
            .map_err(unavailable)?;

        tracing::debug!(
            words = d,
            samples = rows.len(),
            surrogate_score = local.score,
            "Text explanation computed"
        );

        Ok(local
            .features
            .into_iter()
            .map(|(id, weight)| TokenWeight {
                token: indexed.word(id).to_string(),
                weight,
            })
            .collect())
    }
}

fn unavailable(reason: impl Into<String>) -> PipelineError {
    PipelineError::ExplanationUnavailable(reason.into())
}
