//! Explainability generator: per-modality local explanations.
//!
//! Explanation is best effort. Any failure below this module degrades to
//! `ExplanationOutcome::Unavailable` and is never returned as an error.

pub mod image;
pub mod segment;
pub mod surrogate;
pub mod text;

pub use image::ImageExplainer;
pub use segment::GridSegmenter;
pub use text::TextExplainer;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::inference::PreparedInput;
use super::types::{Explanation, ExplanationOutcome, Modality, Prediction};
use super::PipelineError;

/// Hard ceiling on perturbation samples, whatever the configuration says.
pub const MAX_PERTURBATION_SAMPLES: usize = 10_000;

/// Perturbation budget and surrogate settings for one explainer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainerConfig {
    pub num_samples: usize,
    /// Max regions/tokens kept in the surrogate.
    pub num_features: usize,
    /// Labels fitted on the image path. Ignored for text.
    pub top_labels: usize,
    /// Model queries per batch on the image path.
    pub batch_size: usize,
    pub kernel_width: f64,
    /// Fixed RNG seed; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl ExplainerConfig {
    pub fn image_defaults() -> Self {
        Self {
            num_samples: 1000,
            num_features: 10,
            top_labels: 5,
            batch_size: 10,
            kernel_width: 0.25,
            seed: None,
        }
    }

    pub fn text_defaults() -> Self {
        Self {
            num_samples: 500,
            num_features: 10,
            top_labels: 1,
            batch_size: 10,
            kernel_width: 25.0,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Clamp the sample budget into `[1, MAX_PERTURBATION_SAMPLES]`.
    pub fn bounded(mut self) -> Self {
        self.num_samples = self.num_samples.clamp(1, MAX_PERTURBATION_SAMPLES);
        self.num_features = self.num_features.max(1);
        self.top_labels = self.top_labels.max(1);
        self.batch_size = self.batch_size.max(1);
        self
    }
}

pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub struct ExplainabilityGenerator {
    image: ImageExplainer,
    text: TextExplainer,
}

impl ExplainabilityGenerator {
    pub fn new(image: ImageExplainer, text: TextExplainer) -> Self {
        Self { image, text }
    }

    pub fn explain(
        &self,
        modality: Modality,
        input: &PreparedInput,
        prediction: &Prediction,
    ) -> ExplanationOutcome {
        let result = match (modality, input) {
            (Modality::CtScan, PreparedInput::CtScan(scan)) => self
                .image
                .explain(scan, prediction)
                .map(Explanation::RegionHighlight),
            (Modality::TextReport, PreparedInput::TextReport { text, .. }) => self
                .text
                .explain(text, prediction)
                .map(Explanation::TokenWeights),
            (modality, input) => Err(PipelineError::ExplanationUnavailable(format!(
                "{} input cannot be explained on the {} path",
                input.modality().as_str(),
                modality.as_str()
            ))),
        };

        match result {
            Ok(explanation) => ExplanationOutcome::Computed(explanation),
            Err(e) => {
                let reason = match e {
                    PipelineError::ExplanationUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(
                    modality = modality.as_str(),
                    reason = %reason,
                    "Explanation unavailable, continuing without it"
                );
                ExplanationOutcome::Unavailable { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{
        CtLabelMap, FeatureVector, MockCtModel, MockTextClassifier, TfidfVectorizer,
    };
    use crate::pipeline::preprocess::tests::make_test_png;
    use crate::pipeline::preprocess::{CtScanPreprocessor, ImagePreprocessor, ResizeFilter};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn generator(model: MockCtModel) -> ExplainabilityGenerator {
        let labels = Arc::new(CtLabelMap::reference());
        let vocab: HashMap<String, usize> = [("normal".to_string(), 0)].into_iter().collect();
        let image = ImageExplainer::new(
            Arc::new(model),
            labels,
            GridSegmenter::new(4),
            ExplainerConfig {
                num_samples: 30,
                ..ExplainerConfig::image_defaults()
            }
            .with_seed(3),
        );
        let text = TextExplainer::new(
            Arc::new(TfidfVectorizer::from_parts(vocab, vec![1.0]).unwrap()),
            Arc::new(MockTextClassifier::new(&["Benign", "Normal"], "Normal")),
            ExplainerConfig {
                num_samples: 30,
                ..ExplainerConfig::text_defaults()
            }
            .with_seed(3),
        );
        ExplainabilityGenerator::new(image, text)
    }

    fn ct_input() -> PreparedInput {
        let png = make_test_png(64, 64, [90, 90, 90]);
        PreparedInput::CtScan(
            CtScanPreprocessor::new(32, ResizeFilter::Nearest)
                .prepare(&png)
                .unwrap(),
        )
    }

    #[test]
    fn ct_path_yields_region_highlight() {
        let g = generator(MockCtModel::fixed(vec![0.1, 0.7, 0.2]));
        let outcome = g.explain(Modality::CtScan, &ct_input(), &Prediction::ct_scan("Malignant", 0.7));
        match outcome.explanation() {
            Some(Explanation::RegionHighlight(overlay)) => {
                assert_eq!(overlay.explained_label, "Malignant");
            }
            other => panic!("expected region highlight, got {other:?}"),
        }
    }

    #[test]
    fn explainer_error_degrades_to_unavailable() {
        let g = generator(MockCtModel::failing());
        let outcome = g.explain(Modality::CtScan, &ct_input(), &Prediction::ct_scan("Benign", 0.6));
        match outcome {
            ExplanationOutcome::Unavailable { reason } => assert!(reason.contains("model query failed")),
            ExplanationOutcome::Computed(_) => panic!("expected unavailable"),
        }
    }

    #[test]
    fn text_path_yields_token_weights() {
        let g = generator(MockCtModel::fixed(vec![1.0, 0.0, 0.0]));
        let input = PreparedInput::TextReport {
            text: "normal study".into(),
            features: FeatureVector::new(1, vec![(0, 1.0)]),
        };
        let outcome = g.explain(
            Modality::TextReport,
            &input,
            &Prediction::text_report("Normal", "normal study"),
        );
        assert!(matches!(
            outcome.explanation(),
            Some(Explanation::TokenWeights(_))
        ));
        assert_eq!(outcome.explanation().map(Explanation::modality), Some(Modality::TextReport));
    }

    #[test]
    fn mismatched_input_is_unavailable_not_panic() {
        let g = generator(MockCtModel::fixed(vec![1.0, 0.0, 0.0]));
        let outcome = g.explain(Modality::TextReport, &ct_input(), &Prediction::text_report("Normal", ""));
        assert!(!outcome.is_available());
    }

    #[test]
    fn bounded_caps_sample_budget() {
        let cfg = ExplainerConfig {
            num_samples: 1_000_000,
            num_features: 0,
            ..ExplainerConfig::image_defaults()
        }
        .bounded();
        assert_eq!(cfg.num_samples, MAX_PERTURBATION_SAMPLES);
        assert_eq!(cfg.num_features, 1);
    }
}
