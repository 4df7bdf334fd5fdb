//! Inference router: dispatches prepared input to the CT model or the text
//! classifier and normalizes the answer into a `Prediction`.

use std::sync::Arc;

use super::models::{CtLabelMap, CtScanModel, FeatureVector, TextClassifier};
use super::preprocess::PreparedScan;
use super::types::{Modality, Prediction};
use super::PipelineError;

/// Scores may drift a hair outside [0, 1] through float rounding in softmax.
const SCORE_TOLERANCE: f32 = 1e-4;

/// Model-ready input for one run.
#[derive(Debug, Clone)]
pub enum PreparedInput {
    CtScan(PreparedScan),
    TextReport { text: String, features: FeatureVector },
}

impl PreparedInput {
    pub fn modality(&self) -> Modality {
        match self {
            Self::CtScan(_) => Modality::CtScan,
            Self::TextReport { .. } => Modality::TextReport,
        }
    }
}

pub struct InferenceRouter {
    ct_model: Arc<dyn CtScanModel>,
    labels: Arc<CtLabelMap>,
    text_classifier: Arc<dyn TextClassifier>,
}

impl InferenceRouter {
    pub fn new(
        ct_model: Arc<dyn CtScanModel>,
        labels: Arc<CtLabelMap>,
        text_classifier: Arc<dyn TextClassifier>,
    ) -> Self {
        Self {
            ct_model,
            labels,
            text_classifier,
        }
    }

    pub fn infer(&self, modality: Modality, input: &PreparedInput) -> Result<Prediction, PipelineError> {
        match (modality, input) {
            (Modality::CtScan, PreparedInput::CtScan(scan)) => self.infer_ct(scan),
            (Modality::TextReport, PreparedInput::TextReport { text, features }) => {
                self.infer_text(text, features)
            }
            (modality, input) => Err(PipelineError::InferenceFailure(format!(
                "{} input routed to the {} path",
                input.modality().as_str(),
                modality.as_str()
            ))),
        }
    }

    fn infer_ct(&self, scan: &PreparedScan) -> Result<Prediction, PipelineError> {
        let rows = self.ct_model.predict(&scan.tensor)?;
        let scores = match rows.as_slice() {
            [row] => row,
            _ => {
                return Err(PipelineError::InferenceFailure(format!(
                    "CT model returned {} score rows for a batch of 1",
                    rows.len()
                )))
            }
        };
        let (index, confidence) = checked_argmax(scores, self.labels.len())?;
        let label = self.labels.label_for(index).ok_or_else(|| {
            PipelineError::InferenceFailure(format!("No label for class index {index}"))
        })?;

        tracing::debug!(
            label,
            class_index = index,
            confidence,
            scores = ?scores,
            "CT inference complete"
        );
        Ok(Prediction::ct_scan(label, confidence))
    }

    fn infer_text(&self, text: &str, features: &FeatureVector) -> Result<Prediction, PipelineError> {
        let label = self.text_classifier.predict(features)?;
        if label.trim().is_empty() {
            return Err(PipelineError::InferenceFailure(
                "Text classifier returned an empty label".into(),
            ));
        }

        tracing::debug!(label = %label, features = features.nnz(), "Text inference complete");
        Ok(Prediction::text_report(label, text))
    }
}

/// Index and value of the first maximum, after checking the row has one
/// finite score in [0, 1] per known class.
pub(crate) fn checked_argmax(scores: &[f32], classes: usize) -> Result<(usize, f32), PipelineError> {
    if scores.len() != classes {
        return Err(PipelineError::InferenceFailure(format!(
            "Expected {classes} class scores, got {}",
            scores.len()
        )));
    }
    if let Some(bad) = scores
        .iter()
        .find(|s| !s.is_finite() || **s < -SCORE_TOLERANCE || **s > 1.0 + SCORE_TOLERANCE)
    {
        return Err(PipelineError::InferenceFailure(format!(
            "Class score {bad} outside [0, 1]"
        )));
    }

    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    Ok((best, scores[best].clamp(0.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{MockCtModel, MockTextClassifier};
    use crate::pipeline::preprocess::tests::make_test_png;
    use crate::pipeline::preprocess::{CtScanPreprocessor, ImagePreprocessor};

    fn router(model: MockCtModel) -> InferenceRouter {
        InferenceRouter::new(
            Arc::new(model),
            Arc::new(CtLabelMap::reference()),
            Arc::new(MockTextClassifier::new(&["Benign", "Malignant", "Normal"], "Normal")),
        )
    }

    fn ct_input() -> PreparedInput {
        let png = make_test_png(256, 256, [0, 0, 0]);
        PreparedInput::CtScan(CtScanPreprocessor::default().prepare(&png).unwrap())
    }

    #[test]
    fn ct_path_maps_argmax_through_label_order() {
        let cases = [
            (vec![0.7, 0.2, 0.1], "Benign"),
            (vec![0.1, 0.8, 0.1], "Malignant"),
            (vec![0.1, 0.2, 0.7], "Normal"),
        ];
        for (scores, expected) in cases {
            let prediction = router(MockCtModel::fixed(scores))
                .infer(Modality::CtScan, &ct_input())
                .unwrap();
            assert_eq!(prediction.label(), expected);
        }
    }

    #[test]
    fn ct_confidence_is_max_score() {
        let prediction = router(MockCtModel::fixed(vec![0.05, 0.15, 0.8]))
            .infer(Modality::CtScan, &ct_input())
            .unwrap();
        assert!((prediction.confidence().unwrap() - 0.8).abs() < 1e-6);
        assert!(prediction.raw_text().is_none());
    }

    #[test]
    fn ties_resolve_to_lowest_index() {
        let prediction = router(MockCtModel::fixed(vec![0.4, 0.4, 0.2]))
            .infer(Modality::CtScan, &ct_input())
            .unwrap();
        assert_eq!(prediction.label(), "Benign");
    }

    #[test]
    fn wrong_score_count_is_inference_failure() {
        let result = router(MockCtModel::fixed(vec![0.5, 0.5])).infer(Modality::CtScan, &ct_input());
        assert!(matches!(result, Err(PipelineError::InferenceFailure(_))));
    }

    #[test]
    fn out_of_range_or_nan_scores_rejected() {
        for scores in [vec![1.5, 0.0, 0.0], vec![f32::NAN, 0.1, 0.1], vec![-0.5, 0.9, 0.1]] {
            let result = router(MockCtModel::fixed(scores)).infer(Modality::CtScan, &ct_input());
            assert!(matches!(result, Err(PipelineError::InferenceFailure(_))));
        }
    }

    #[test]
    fn oracle_error_is_inference_failure() {
        let result = router(MockCtModel::failing()).infer(Modality::CtScan, &ct_input());
        assert!(matches!(result, Err(PipelineError::InferenceFailure(_))));
    }

    #[test]
    fn text_path_returns_classifier_label_and_text() {
        let input = PreparedInput::TextReport {
            text: "IMPRESSION: NORMAL".into(),
            features: FeatureVector::new(4, vec![(1, 1.0)]),
        };
        let prediction = router(MockCtModel::fixed(vec![1.0, 0.0, 0.0]))
            .infer(Modality::TextReport, &input)
            .unwrap();
        assert_eq!(prediction.label(), "Normal");
        assert_eq!(prediction.raw_text(), Some("IMPRESSION: NORMAL"));
        assert!(prediction.confidence().is_none());
    }

    #[test]
    fn empty_text_label_is_inference_failure() {
        let r = InferenceRouter::new(
            Arc::new(MockCtModel::fixed(vec![1.0, 0.0, 0.0])),
            Arc::new(CtLabelMap::reference()),
            Arc::new(MockTextClassifier::new(&["A", "B"], " ")),
        );
        let input = PreparedInput::TextReport {
            text: String::new(),
            features: FeatureVector::default(),
        };
        assert!(matches!(
            r.infer(Modality::TextReport, &input),
            Err(PipelineError::InferenceFailure(_))
        ));
    }

    #[test]
    fn modality_input_mismatch_rejected() {
        let result = router(MockCtModel::fixed(vec![1.0, 0.0, 0.0])).infer(Modality::TextReport, &ct_input());
        assert!(matches!(result, Err(PipelineError::InferenceFailure(_))));
    }

    #[test]
    fn index_name_index_roundtrip_through_router_labels() {
        let labels = CtLabelMap::reference();
        for (i, name) in ["Benign", "Malignant", "Normal"].iter().enumerate() {
            assert_eq!(labels.label_for(i), Some(*name));
            assert_eq!(labels.index_of(name), Some(i));
        }
    }
}
