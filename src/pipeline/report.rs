//! Report assembly: prediction + explanation + optional source image into
//! one immutable aggregate. Pure composition, no I/O.

use base64::Engine as _;
use image::RgbImage;
use serde::Serialize;

use super::explain::text::IndexedText;
use super::preprocess::encode_png;
use super::types::{Explanation, ExplanationOutcome, Modality, Prediction, TokenWeight};
use super::PipelineError;

/// Piece of the extracted text, with the explanation weight if the piece is
/// an explained token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighlightSpan {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportWarning {
    /// Text path ran but OCR found nothing to classify.
    NoTextExtracted,
}

impl ReportWarning {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoTextExtracted => "No text could be extracted; classification is low confidence",
        }
    }
}

/// Built once per run and consumed once by the renderer.
#[derive(Debug, Clone)]
pub struct Report {
    prediction: Prediction,
    explanation: ExplanationOutcome,
    source_image: Option<RgbImage>,
    highlighted_text: Option<Vec<HighlightSpan>>,
    warnings: Vec<ReportWarning>,
}

impl Report {
    /// Compose a report. An explanation whose variant does not belong to the
    /// prediction's modality is downgraded to unavailable.
    pub fn assemble(
        prediction: Prediction,
        explanation: ExplanationOutcome,
        source_image: Option<RgbImage>,
    ) -> Self {
        let explanation = match explanation {
            ExplanationOutcome::Computed(e) if e.modality() != prediction.modality() => {
                ExplanationOutcome::unavailable(format!(
                    "{} explanation cannot describe a {} prediction",
                    e.modality().as_str(),
                    prediction.modality().as_str()
                ))
            }
            other => other,
        };

        let mut warnings = Vec::new();
        let highlighted_text = prediction.raw_text().map(|text| {
            if text.is_empty() {
                warnings.push(ReportWarning::NoTextExtracted);
            }
            let tokens = match explanation.explanation() {
                Some(Explanation::TokenWeights(tokens)) => tokens.as_slice(),
                _ => &[],
            };
            highlight(text, tokens)
        });

        Self {
            prediction,
            explanation,
            source_image,
            highlighted_text,
            warnings,
        }
    }

    pub fn prediction(&self) -> &Prediction {
        &self.prediction
    }

    pub fn modality(&self) -> Modality {
        self.prediction.modality()
    }

    pub fn explanation(&self) -> &ExplanationOutcome {
        &self.explanation
    }

    pub fn source_image(&self) -> Option<&RgbImage> {
        self.source_image.as_ref()
    }

    pub fn highlighted_text(&self) -> Option<&[HighlightSpan]> {
        self.highlighted_text.as_deref()
    }

    pub fn warnings(&self) -> &[ReportWarning] {
        &self.warnings
    }

    /// Caller-facing JSON view of the report.
    pub fn summary(&self) -> Result<ReportSummary, PipelineError> {
        let (tokens, overlay) = match self.explanation.explanation() {
            Some(Explanation::TokenWeights(tokens)) => (Some(tokens.as_slice()), None),
            Some(Explanation::RegionHighlight(region)) => (None, Some(&region.overlay)),
            None => (None, None),
        };
        let explanation_image = overlay
            .map(|img| {
                encode_png(img)
                    .map(|png| {
                        format!(
                            "data:image/png;base64,{}",
                            base64::engine::general_purpose::STANDARD.encode(png)
                        )
                    })
                    .map_err(|e| PipelineError::RenderingFailure(e.to_string()))
            })
            .transpose()?;

        Ok(ReportSummary {
            modality: self.modality(),
            kind: self.modality().display_name(),
            predicted_class: self.prediction.label().to_string(),
            probability: self.prediction.confidence(),
            extracted_text: self.prediction.raw_text().map(str::to_string),
            lime_explanation: tokens.map(|t| {
                t.iter()
                    .map(|tw| (tw.token.clone(), tw.weight))
                    .collect()
            }),
            explanation_available: self.explanation.is_available(),
            explanation_unavailable_reason: match &self.explanation {
                ExplanationOutcome::Unavailable { reason } => Some(reason.clone()),
                ExplanationOutcome::Computed(_) => None,
            },
            explanation_image,
            warnings: self.warnings.iter().map(|w| w.message().to_string()).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub modality: Modality,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub predicted_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lime_explanation: Option<Vec<(String, f64)>>,
    pub explanation_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_unavailable_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_image: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Split `text` into spans, marking whole words equal to an explained token.
/// Matching is exact per word: a token never marks part of a longer word.
pub fn highlight(text: &str, tokens: &[TokenWeight]) -> Vec<HighlightSpan> {
    let mut spans: Vec<HighlightSpan> = Vec::new();
    for (piece, is_word) in IndexedText::new(text).pieces() {
        let weight = if is_word {
            tokens.iter().find(|t| t.token == piece).map(|t| t.weight)
        } else {
            None
        };
        match (spans.last_mut(), weight) {
            (Some(last), None) if last.weight.is_none() => last.text.push_str(piece),
            _ => spans.push(HighlightSpan {
                text: piece.to_string(),
                weight,
            }),
        }
    }
    spans
}
