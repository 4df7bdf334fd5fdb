//! Modality detection: CT scan vs scanned text report.
//!
//! The image is decoded in grayscale and handed to OCR. What counts as
//! "text found" is a `ModalityPolicy`, so the heuristic can be tuned or
//! replaced without touching the detector.
//!
//! Known false positive: scanner watermarks or burned-in annotations on a
//! CT slice produce OCR text and route the scan to the text path. The
//! per-request override exists for exactly that case.

use std::sync::Arc;

use super::ocr::OcrEngine;
use super::preprocess::{decode_grayscale, encode_gray_png};
use super::types::Modality;
use super::PipelineError;

/// Decides modality from OCR output alone.
pub trait ModalityPolicy: Send + Sync {
    fn classify(&self, ocr_text: &str) -> Modality;

    fn name(&self) -> &'static str;
}

/// Text report iff the trimmed OCR text has at least `min_chars` characters.
/// `min_chars = 1` is "any text at all".
#[derive(Debug, Clone)]
pub struct TextPresencePolicy {
    min_chars: usize,
}

impl Default for TextPresencePolicy {
    fn default() -> Self {
        Self { min_chars: 1 }
    }
}

impl TextPresencePolicy {
    pub fn new(min_chars: usize) -> Self {
        Self {
            min_chars: min_chars.max(1),
        }
    }
}

impl ModalityPolicy for TextPresencePolicy {
    fn classify(&self, ocr_text: &str) -> Modality {
        if ocr_text.trim().chars().count() >= self.min_chars {
            Modality::TextReport
        } else {
            Modality::CtScan
        }
    }

    fn name(&self) -> &'static str {
        "text_presence"
    }
}

pub struct ModalityDetector {
    ocr: Arc<dyn OcrEngine>,
    policy: Box<dyn ModalityPolicy>,
}

impl ModalityDetector {
    pub fn new(ocr: Arc<dyn OcrEngine>, policy: Box<dyn ModalityPolicy>) -> Self {
        Self { ocr, policy }
    }

    /// Classify raw upload bytes. Fails with `InvalidImage` if they do not decode.
    pub fn detect(&self, image_bytes: &[u8]) -> Result<Modality, PipelineError> {
        let gray = decode_grayscale(image_bytes)?;
        let png = encode_gray_png(&gray)?;
        let text = self.ocr.ocr_image(&png)?;
        let modality = self.policy.classify(&text);

        tracing::debug!(
            policy = self.policy.name(),
            ocr_chars = text.trim().chars().count(),
            modality = modality.as_str(),
            "Modality detected"
        );
        Ok(modality)
    }

    /// Like `detect`, but a caller-supplied modality wins over the policy.
    /// The image must still decode: an override does not bypass validation.
    pub fn detect_with_override(
        &self,
        image_bytes: &[u8],
        override_modality: Option<Modality>,
    ) -> Result<Modality, PipelineError> {
        match override_modality {
            Some(modality) => {
                decode_grayscale(image_bytes)?;
                tracing::debug!(modality = modality.as_str(), "Modality overridden by caller");
                Ok(modality)
            }
            None => self.detect(image_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::MockOcrEngine;
    use crate::pipeline::preprocess::tests::make_test_png;

    fn detector(ocr_text: &str) -> ModalityDetector {
        ModalityDetector::new(
            Arc::new(MockOcrEngine::new(ocr_text)),
            Box::new(TextPresencePolicy::default()),
        )
    }

    #[test]
    fn empty_ocr_means_ct_scan() {
        let png = make_test_png(256, 256, [0, 0, 0]);
        assert_eq!(detector("").detect(&png).unwrap(), Modality::CtScan);
    }

    #[test]
    fn whitespace_only_ocr_means_ct_scan() {
        let png = make_test_png(64, 64, [0, 0, 0]);
        assert_eq!(detector(" \n\t \x0c").detect(&png).unwrap(), Modality::CtScan);
    }

    #[test]
    fn any_text_means_text_report() {
        let png = make_test_png(64, 64, [255, 255, 255]);
        let modality = detector("PATIENT: JOHN DOE, IMPRESSION: NORMAL")
            .detect(&png)
            .unwrap();
        assert_eq!(modality, Modality::TextReport);
    }

    #[test]
    fn stray_watermark_characters_route_to_text() {
        // Accepted heuristic limitation, pinned so a change is deliberate.
        let png = make_test_png(64, 64, [0, 0, 0]);
        assert_eq!(detector("R").detect(&png).unwrap(), Modality::TextReport);
    }

    #[test]
    fn policy_is_pure_function_of_ocr_text() {
        let policy = TextPresencePolicy::default();
        for text in ["", "   ", "a", "IMPRESSION", "\n"] {
            assert_eq!(policy.classify(text), policy.classify(text));
        }
        assert_eq!(policy.classify(""), Modality::CtScan);
        assert_eq!(policy.classify("a"), Modality::TextReport);
    }

    #[test]
    fn min_chars_threshold_filters_short_noise() {
        let policy = TextPresencePolicy::new(4);
        assert_eq!(policy.classify(" R2 "), Modality::CtScan);
        assert_eq!(policy.classify("IMPRESSION"), Modality::TextReport);
    }

    #[test]
    fn corrupt_bytes_are_invalid_image() {
        let result = detector("").detect(&[0u8; 200]);
        assert!(matches!(result, Err(PipelineError::InvalidImage(_))));
    }

    #[test]
    fn ocr_failure_propagates() {
        let d = ModalityDetector::new(
            Arc::new(MockOcrEngine::failing()),
            Box::new(TextPresencePolicy::default()),
        );
        let png = make_test_png(64, 64, [0, 0, 0]);
        assert!(matches!(d.detect(&png), Err(PipelineError::OcrFailure(_))));
    }

    #[test]
    fn override_wins_but_still_validates_image() {
        let png = make_test_png(64, 64, [0, 0, 0]);
        let d = detector("lots of text");
        assert_eq!(
            d.detect_with_override(&png, Some(Modality::CtScan)).unwrap(),
            Modality::CtScan
        );
        assert!(matches!(
            d.detect_with_override(&[1u8; 300], Some(Modality::CtScan)),
            Err(PipelineError::InvalidImage(_))
        ));
    }
}
