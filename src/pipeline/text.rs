//! Text report path: OCR extraction and vectorization.

use std::sync::Arc;

use super::models::{FeatureVector, TextVectorizer};
use super::ocr::OcrEngine;
use super::preprocess::{decode_rgb, encode_png};
use super::PipelineError;

/// Runs OCR over a color decode of the upload and trims the result.
pub struct TextExtractor {
    ocr: Arc<dyn OcrEngine>,
}

impl TextExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>) -> Self {
        Self { ocr }
    }

    /// An empty string is a valid result: the report carries a no-text
    /// warning instead of failing the run.
    pub fn extract(&self, image_bytes: &[u8]) -> Result<String, PipelineError> {
        let rgb = decode_rgb(image_bytes)?;
        let png = encode_png(&rgb)?;
        let raw = self.ocr.ocr_image(&png)?;
        let text = raw.trim().to_string();

        tracing::debug!(
            raw_chars = raw.chars().count(),
            chars = text.chars().count(),
            "Text extracted"
        );
        Ok(text)
    }
}

/// Pass-through to the vectorizer fitted at training time. The same
/// instance is shared by every run and by the text explainer.
#[derive(Clone)]
pub struct TextVectorizerStage {
    vectorizer: Arc<dyn TextVectorizer>,
}

impl TextVectorizerStage {
    pub fn new(vectorizer: Arc<dyn TextVectorizer>) -> Self {
        Self { vectorizer }
    }

    pub fn vectorize(&self, text: &str) -> FeatureVector {
        self.vectorizer.transform(text)
    }

    pub fn vectorizer(&self) -> &Arc<dyn TextVectorizer> {
        &self.vectorizer
    }
}
