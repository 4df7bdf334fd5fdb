//! Perturbation explainer for the CT model.
//!
//! The resized scan is cut into grid segments. Each sample keeps a random
//! subset of segments and blacks out the rest, the model scores the batch,
//! and a local surrogate per explained label attributes the score to
//! segments. The overlay outlines the positively contributing segments of
//! the top label.

use std::sync::Arc;

use image::Rgb;
use rand::rngs::StdRng;
use rand::Rng;

use super::segment::{GridSegmenter, Segmentation};
use super::surrogate::{cosine_distance_to_original, explain_instance, exponential_kernel};
use super::{make_rng, ExplainerConfig};
use crate::pipeline::models::{CtLabelMap, CtScanModel};
use crate::pipeline::preprocess::{PreparedScan, Tensor, CT_CHANNELS};
use crate::pipeline::types::{Prediction, RegionOverlay, RegionWeight};
use crate::pipeline::PipelineError;

/// Colour perturbed-out segments are filled with.
const HIDE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

pub struct ImageExplainer {
    model: Arc<dyn CtScanModel>,
    labels: Arc<CtLabelMap>,
    segmenter: GridSegmenter,
    config: ExplainerConfig,
}

impl ImageExplainer {
    pub fn new(
        model: Arc<dyn CtScanModel>,
        labels: Arc<CtLabelMap>,
        segmenter: GridSegmenter,
        config: ExplainerConfig,
    ) -> Self {
        Self {
            model,
            labels,
            segmenter,
            config,
        }
    }

    pub fn config(&self) -> &ExplainerConfig {
        &self.config
    }

    pub fn explain(&self, scan: &PreparedScan, prediction: &Prediction) -> Result<RegionOverlay, PipelineError> {
        let segments = self.segmenter.segment(&scan.image);
        if segments.count() < 2 {
            return Err(unavailable("image too small to segment"));
        }

        let mut rng = make_rng(self.config.seed);
        let rows = sample_rows(&mut rng, self.config.num_samples, segments.count());
        let scores = self.score_samples(scan, &segments, &rows)?;

        let top_labels = rank_labels(&scores[0], self.config.top_labels);
        let predicted = self
            .labels
            .index_of(prediction.label())
            .ok_or_else(|| unavailable(format!("label {:?} unknown to CT label map", prediction.label())))?;
        if top_labels.first() != Some(&predicted) {
            tracing::debug!(
                predicted,
                top = ?top_labels.first(),
                "Unperturbed top label differs from prediction"
            );
        }

        let weights: Vec<f64> = rows
            .iter()
            .map(|r| exponential_kernel(cosine_distance_to_original(r), self.config.kernel_width))
            .collect();

        let mut primary = None;
        for &label in &top_labels {
            let targets: Vec<f64> = scores.iter().map(|row| f64::from(row[label])).collect();
            let local = explain_instance(&rows, &targets, &weights, self.config.num_features)
                .map_err(unavailable)?;
            tracing::debug!(
                label = self.labels.label_for(label).unwrap_or_default(),
                surrogate_score = local.score,
                "Local surrogate fitted"
            );
            if label == predicted {
                primary = Some(local);
            }
        }
        // The predicted label is always explained, even if it falls outside top_labels.
        let local = match primary {
            Some(local) => local,
            None => {
                let targets: Vec<f64> = scores.iter().map(|row| f64::from(row[predicted])).collect();
                explain_instance(&rows, &targets, &weights, self.config.num_features)
                    .map_err(unavailable)?
            }
        };

        let positive: Vec<usize> = local
            .features
            .iter()
            .filter(|(_, w)| *w > 0.0)
            .map(|(s, _)| *s)
            .collect();
        let overlay = segments.mark_boundaries(&scan.image, &positive);

        Ok(RegionOverlay {
            overlay,
            explained_label: prediction.label().to_string(),
            regions: local
                .features
                .iter()
                .map(|&(segment, weight)| RegionWeight { segment, weight })
                .collect(),
            surrogate_score: local.score,
        })
    }

    /// Model scores per sample row, queried in batches.
    fn score_samples(
        &self,
        scan: &PreparedScan,
        segments: &Segmentation,
        rows: &[Vec<f64>],
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let (w, h) = scan.image.dimensions();
        let batch_size = self.config.batch_size.max(1);
        let mut scores = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(batch_size) {
            let mut data = Vec::with_capacity(chunk.len() * (w * h) as usize * CT_CHANNELS);
            for row in chunk {
                let active: Vec<bool> = row.iter().map(|&v| v > 0.5).collect();
                let perturbed = segments.perturb(&scan.image, &active, HIDE_COLOR);
                data.extend(perturbed.as_raw().iter().map(|&v| f32::from(v) / 255.0));
            }
            let batch = Tensor::new([chunk.len(), h as usize, w as usize, CT_CHANNELS], data)
                .map_err(|e| unavailable(e.to_string()))?;

            let batch_scores = self
                .model
                .predict(&batch)
                .map_err(|e| unavailable(format!("model query failed: {e}")))?;
            if batch_scores.len() != chunk.len() {
                return Err(unavailable(format!(
                    "model returned {} rows for a batch of {}",
                    batch_scores.len(),
                    chunk.len()
                )));
            }
            for row in batch_scores {
                if row.len() != self.labels.len() || row.iter().any(|s| !s.is_finite()) {
                    return Err(unavailable(format!("malformed score row {row:?}")));
                }
                scores.push(row);
            }
        }
        Ok(scores)
    }
}

fn unavailable(reason: impl Into<String>) -> PipelineError {
    PipelineError::ExplanationUnavailable(reason.into())
}

/// Binary keep/hide rows. The first row keeps every segment.
fn sample_rows(rng: &mut StdRng, num_samples: usize, features: usize) -> Vec<Vec<f64>> {
    let mut rows = Vec::with_capacity(num_samples.max(1));
    rows.push(vec![1.0; features]);
    for _ in 1..num_samples {
        rows.push(
            (0..features)
                .map(|_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 })
                .collect(),
        );
    }
    rows
}

/// Class indices by descending score, at most `k`.
fn rank_labels(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k.max(1));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::MockCtModel;
    use crate::pipeline::preprocess::tests::make_test_png;
    use crate::pipeline::explain::segment::BOUNDARY_COLOR;
    use crate::pipeline::preprocess::{CtScanPreprocessor, ImagePreprocessor, ResizeFilter};

    fn scan(size: u32) -> PreparedScan {
        let png = make_test_png(64, 64, [200, 200, 200]);
        CtScanPreprocessor::new(size, ResizeFilter::Nearest)
            .prepare(&png)
            .unwrap()
    }

    fn config(samples: usize) -> ExplainerConfig {
        ExplainerConfig {
            num_samples: samples,
            ..ExplainerConfig::image_defaults()
        }
        .with_seed(7)
    }

    /// Malignant score rises with the brightness of the top-left quadrant.
    fn quadrant_model(size: usize) -> MockCtModel {
        MockCtModel::from_fn(move |item| {
            let half = size / 2;
            let mut sum = 0.0;
            for y in 0..half {
                for x in 0..half {
                    sum += item[(y * size + x) * 3];
                }
            }
            let bright = sum / (half * half) as f32;
            let malignant = 0.2 + 0.7 * bright;
            vec![(1.0 - malignant) / 2.0, malignant, (1.0 - malignant) / 2.0]
        })
    }

    #[test]
    fn highlights_the_segments_driving_the_score() {
        let model = Arc::new(quadrant_model(32));
        let explainer = ImageExplainer::new(
            model.clone(),
            Arc::new(CtLabelMap::reference()),
            GridSegmenter::new(4),
            config(200),
        );
        let prediction = Prediction::ct_scan("Malignant", 0.75);
        let overlay = explainer.explain(&scan(32), &prediction).unwrap();

        assert_eq!(overlay.explained_label, "Malignant");
        assert_eq!(overlay.regions.len(), 10);
        // top-left quadrant of a 4x4 grid = segments 0, 1, 4, 5
        let top4: Vec<usize> = overlay.regions[..4].iter().map(|r| r.segment).collect();
        for s in [0, 1, 4, 5] {
            assert!(top4.contains(&s), "segment {s} missing from {top4:?}");
        }
        assert!(overlay.regions[..4].iter().all(|r| r.weight > 0.0));
        assert!(overlay.overlay.pixels().any(|p| *p == BOUNDARY_COLOR));
        assert_eq!(overlay.overlay.dimensions(), (32, 32));
        // 200 samples in batches of 10
        assert_eq!(model.calls(), 20);
    }

    #[test]
    fn same_seed_same_explanation() {
        let explainer = ImageExplainer::new(
            Arc::new(quadrant_model(32)),
            Arc::new(CtLabelMap::reference()),
            GridSegmenter::new(4),
            config(60),
        );
        let prediction = Prediction::ct_scan("Malignant", 0.75);
        let a = explainer.explain(&scan(32), &prediction).unwrap();
        let b = explainer.explain(&scan(32), &prediction).unwrap();
        assert_eq!(a.regions, b.regions);
        assert_eq!(a.overlay, b.overlay);
    }

    #[test]
    fn model_failure_is_explanation_unavailable() {
        let explainer = ImageExplainer::new(
            Arc::new(MockCtModel::failing()),
            Arc::new(CtLabelMap::reference()),
            GridSegmenter::new(4),
            config(20),
        );
        let result = explainer.explain(&scan(32), &Prediction::ct_scan("Benign", 0.5));
        assert!(matches!(result, Err(PipelineError::ExplanationUnavailable(_))));
    }

    #[test]
    fn malformed_scores_are_explanation_unavailable() {
        let explainer = ImageExplainer::new(
            Arc::new(MockCtModel::fixed(vec![0.5, 0.5])),
            Arc::new(CtLabelMap::reference()),
            GridSegmenter::new(4),
            config(20),
        );
        let result = explainer.explain(&scan(32), &Prediction::ct_scan("Benign", 0.5));
        assert!(matches!(result, Err(PipelineError::ExplanationUnavailable(_))));
    }

    #[test]
    fn first_sample_keeps_everything() {
        let mut rng = make_rng(Some(1));
        let rows = sample_rows(&mut rng, 5, 6);
        assert_eq!(rows.len(), 5);
        assert!(rows[0].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn rank_labels_descending_and_capped() {
        assert_eq!(rank_labels(&[0.1, 0.7, 0.2], 5), vec![1, 2, 0]);
        assert_eq!(rank_labels(&[0.1, 0.7, 0.2], 1), vec![1]);
    }
}
