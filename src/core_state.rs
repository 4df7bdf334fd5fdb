//! Process-wide application state.
//!
//! `CoreState` is built once at start-up and shared by every request
//! behind an `Arc`. It owns the configuration and the orchestrator, which in
//! turn holds the pre-loaded oracles. Nothing in here is mutated per request
//! except the run counters.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{ConfigError, ServiceConfig};
use crate::pipeline::artifact::{cleanup_orphaned_files, UploadedArtifact};
use crate::pipeline::models::{
    load_ct_model, CtLabelMap, LinearTextClassifier, OracleError, TextClassifier,
    TextVectorizer, TfidfVectorizer,
};
use crate::pipeline::ocr::{OcrEngine, TesseractCli};
use crate::pipeline::orchestrator::{Oracles, PipelineOrchestrator, PipelineRun, RunOptions};
use crate::pipeline::render::PdfReportRenderer;
use crate::pipeline::store::ReportStore;
use crate::pipeline::PipelineError;

/// File names expected under the model directory.
pub const CT_MODEL_FILE: &str = "ct_model.onnx";
pub const CT_LABELS_FILE: &str = "ct_labels.json";
pub const TEXT_CLASSIFIER_FILE: &str = "text_classifier.json";
pub const TFIDF_VECTORIZER_FILE: &str = "tfidf_vectorizer.json";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Oracle loading failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("Incompatible oracles: {0}")]
    IncompatibleOracles(String),

    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),

    #[error("Work directory unusable: {0}")]
    Storage(String),

    #[error("HTTP server failed: {0}")]
    Server(String),
}

// ═══════════════════════════════════════════════════════════
// Oracle loading
// ═══════════════════════════════════════════════════════════

/// Load the fitted vectorizer and text classifier, checking that they agree
/// on the feature space.
pub fn load_text_oracles(
    model_dir: &Path,
) -> Result<(Arc<dyn TextVectorizer>, Arc<dyn TextClassifier>), CoreError> {
    let vectorizer = TfidfVectorizer::load(&model_dir.join(TFIDF_VECTORIZER_FILE))?;
    let classifier = LinearTextClassifier::load(&model_dir.join(TEXT_CLASSIFIER_FILE))?;
    if vectorizer.dimension() != classifier.dimension() {
        return Err(CoreError::IncompatibleOracles(format!(
            "vectorizer emits {} features, classifier expects {}",
            vectorizer.dimension(),
            classifier.dimension()
        )));
    }
    Ok((Arc::new(vectorizer), Arc::new(classifier)))
}

/// Load the CT label map, warning if it was exported for a different model file.
pub fn load_ct_labels(model_dir: &Path) -> Result<CtLabelMap, CoreError> {
    let labels = CtLabelMap::load(&model_dir.join(CT_LABELS_FILE))?;
    if let Some(model) = labels.model_file() {
        if model != CT_MODEL_FILE {
            tracing::warn!(
                label_model = model,
                expected = CT_MODEL_FILE,
                "CT label map names a different model file"
            );
        }
    }
    Ok(labels)
}

/// Load every oracle the pipeline needs. Any failure aborts start-up.
pub fn load_oracles(config: &ServiceConfig) -> Result<Oracles, CoreError> {
    let ocr = TesseractCli::new(&config.tesseract).with_languages(&config.ocr_lang);
    let version = ocr
        .probe()
        .map_err(|e| CoreError::OcrUnavailable(e.to_string()))?;
    tracing::info!(version = %version, lang = %config.ocr_lang, "OCR engine ready");

    let ct_labels = load_ct_labels(&config.model_dir)?;
    let ct_model = load_ct_model(&config.model_dir.join(CT_MODEL_FILE))?;
    let (vectorizer, text_classifier) = load_text_oracles(&config.model_dir)?;

    Ok(Oracles {
        ocr: Arc::new(ocr) as Arc<dyn OcrEngine>,
        ct_model,
        ct_labels: Arc::new(ct_labels),
        vectorizer,
        text_classifier,
    })
}

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct RunCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub uptime_secs: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
}

pub struct CoreState {
    config: ServiceConfig,
    orchestrator: PipelineOrchestrator,
    started_at: Instant,
    counters: RunCounters,
}

impl CoreState {
    /// Load oracles from disk and prepare the work directory.
    pub fn initialize(config: ServiceConfig) -> Result<Self, CoreError> {
        let oracles = load_oracles(&config)?;
        Self::with_oracles(config, oracles)
    }

    /// Build state around already-loaded oracles.
    pub fn with_oracles(config: ServiceConfig, oracles: Oracles) -> Result<Self, CoreError> {
        let uploads = config.uploads_dir();
        std::fs::create_dir_all(&uploads)
            .map_err(|e| CoreError::Storage(format!("{}: {e}", uploads.display())))?;
        let removed = cleanup_orphaned_files(&uploads);
        if removed > 0 {
            tracing::info!(removed, "Removed orphaned uploads from previous run");
        }

        let store = ReportStore::open(&config.reports_dir())
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .with_ttl(config.report_ttl);
        let orchestrator = PipelineOrchestrator::new(
            oracles,
            config.pipeline_settings(),
            Box::new(PdfReportRenderer),
            store,
        );

        Ok(Self {
            config,
            orchestrator,
            started_at: Instant::now(),
            counters: RunCounters::default(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Stage raw upload bytes in the uploads directory.
    pub fn stage_upload(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<UploadedArtifact, PipelineError> {
        UploadedArtifact::stage(bytes, content_type, &self.config.uploads_dir())
    }

    /// Run the pipeline synchronously. Call from a blocking context.
    pub fn run_pipeline(&self, artifact: UploadedArtifact, options: RunOptions) -> PipelineRun {
        let run = self.orchestrator.run(artifact, options);
        let counter = if run.is_success() {
            &self.counters.completed
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        run
    }

    /// Fetch a rendered report once; later calls return `None`.
    pub fn take_report(&self, id: &Uuid) -> Result<Option<Vec<u8>>, PipelineError> {
        self.orchestrator.store().take(id)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            runs_completed: self.counters.completed.load(Ordering::Relaxed),
            runs_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
