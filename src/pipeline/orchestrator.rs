//! Pipeline orchestrator: sequences the stages of one run and owns the
//! uploaded artifact until the run reaches a terminal state.
//!
//! Received → Detecting → {PreparingImage | ExtractingText} → Inferring →
//! Explaining → Assembling → Rendered | Failed

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use super::artifact::UploadedArtifact;
use super::detection::{ModalityDetector, TextPresencePolicy};
use super::explain::{
    ExplainabilityGenerator, ExplainerConfig, GridSegmenter, ImageExplainer, TextExplainer,
};
use super::inference::{InferenceRouter, PreparedInput};
use super::models::{CtLabelMap, CtScanModel, TextClassifier, TextVectorizer};
use super::ocr::OcrEngine;
use super::preprocess::{CtScanPreprocessor, ImagePreprocessor};
use super::render::{RenderedReport, ReportRenderer};
use super::report::{Report, ReportSummary};
use super::store::ReportStore;
use super::text::{TextExtractor, TextVectorizerStage};
use super::types::Modality;
use super::PipelineError;

// ═══════════════════════════════════════════════════════════
// Run state machine
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Received,
    Detecting,
    PreparingImage,
    ExtractingText,
    Inferring,
    Explaining,
    Assembling,
    Rendered,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Detecting => "detecting",
            Self::PreparingImage => "preparing_image",
            Self::ExtractingText => "extracting_text",
            Self::Inferring => "inferring",
            Self::Explaining => "explaining",
            Self::Assembling => "assembling",
            Self::Rendered => "rendered",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rendered | Self::Failed)
    }

    pub fn can_transition_to(&self, next: RunStage) -> bool {
        use RunStage::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Received, Detecting)
            | (Detecting, PreparingImage)
            | (Detecting, ExtractingText)
            | (PreparingImage, Inferring)
            | (ExtractingText, Inferring)
            | (Inferring, Explaining)
            | (Explaining, Assembling)
            | (Assembling, Rendered) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: RunStage,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Per-run bookkeeping: current stage, history and timings.
struct RunContext {
    run_id: Uuid,
    stage: RunStage,
    modality: Option<Modality>,
    started: Instant,
    stage_started: Instant,
    timings: Vec<StageTiming>,
}

impl RunContext {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            run_id: Uuid::new_v4(),
            stage: RunStage::Received,
            modality: None,
            started: now,
            stage_started: now,
            timings: Vec::new(),
        }
    }

    fn advance(&mut self, next: RunStage) {
        debug_assert!(
            self.stage.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.stage,
            next
        );
        let now = Instant::now();
        self.timings.push(StageTiming {
            stage: self.stage,
            elapsed: now - self.stage_started,
        });
        tracing::debug!(from = self.stage.as_str(), to = next.as_str(), "Stage transition");
        self.stage = next;
        self.stage_started = now;
    }
}

// ═══════════════════════════════════════════════════════════
// Run results
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, Copy)]
pub struct RunOptions {
    /// Caller-asserted modality; skips the OCR heuristic.
    pub modality_override: Option<Modality>,
}

#[derive(Debug)]
pub struct CompletedRun {
    pub report_id: Uuid,
    pub summary: ReportSummary,
    pub rendered: RenderedReport,
}

#[derive(Debug)]
pub struct RunFailure {
    /// Stage that was active when the error occurred.
    pub stage: RunStage,
    pub modality: Option<Modality>,
    pub error: PipelineError,
}

#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub outcome: Result<CompletedRun, RunFailure>,
    pub final_stage: RunStage,
    /// Time spent in each non-terminal stage, in order.
    pub stages: Vec<StageTiming>,
    /// Total wall-clock time of the run.
    pub elapsed: Duration,
    pub artifact_released: bool,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn visited(&self) -> Vec<RunStage> {
        let mut stages: Vec<RunStage> = self.stages.iter().map(|t| t.stage).collect();
        stages.push(self.final_stage);
        stages
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

/// Pre-loaded, read-only oracles shared by every run.
#[derive(Clone)]
pub struct Oracles {
    pub ocr: Arc<dyn OcrEngine>,
    pub ct_model: Arc<dyn CtScanModel>,
    pub ct_labels: Arc<CtLabelMap>,
    pub vectorizer: Arc<dyn TextVectorizer>,
    pub text_classifier: Arc<dyn TextClassifier>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_text_chars: usize,
    pub image_explainer: ExplainerConfig,
    pub text_explainer: ExplainerConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_text_chars: 1,
            image_explainer: ExplainerConfig::image_defaults(),
            text_explainer: ExplainerConfig::text_defaults(),
        }
    }
}

pub struct PipelineOrchestrator {
    detector: ModalityDetector,
    preprocessor: Box<dyn ImagePreprocessor>,
    extractor: TextExtractor,
    vectorizer: TextVectorizerStage,
    router: InferenceRouter,
    explainer: ExplainabilityGenerator,
    renderer: Box<dyn ReportRenderer>,
    store: ReportStore,
}

impl PipelineOrchestrator {
    pub fn new(
        oracles: Oracles,
        settings: PipelineSettings,
        renderer: Box<dyn ReportRenderer>,
        store: ReportStore,
    ) -> Self {
        let detector = ModalityDetector::new(
            oracles.ocr.clone(),
            Box::new(TextPresencePolicy::new(settings.min_text_chars)),
        );
        let explainer = ExplainabilityGenerator::new(
            ImageExplainer::new(
                oracles.ct_model.clone(),
                oracles.ct_labels.clone(),
                GridSegmenter::default(),
                settings.image_explainer.bounded(),
            ),
            TextExplainer::new(
                oracles.vectorizer.clone(),
                oracles.text_classifier.clone(),
                settings.text_explainer.bounded(),
            ),
        );

        Self {
            detector,
            preprocessor: Box::new(CtScanPreprocessor::default()),
            extractor: TextExtractor::new(oracles.ocr),
            vectorizer: TextVectorizerStage::new(oracles.vectorizer),
            router: InferenceRouter::new(
                oracles.ct_model,
                oracles.ct_labels,
                oracles.text_classifier,
            ),
            explainer,
            renderer,
            store,
        }
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    /// Run the pipeline over one upload. Never panics on stage failure and
    /// always releases the artifact.
    pub fn run(&self, artifact: UploadedArtifact, options: RunOptions) -> PipelineRun {
        let mut ctx = RunContext::new();
        let span = tracing::info_span!(
            "pipeline_run",
            run_id = %ctx.run_id,
            upload_sha256 = artifact.short_hash()
        );
        let _guard = span.enter();
        tracing::debug!(
            size = artifact.size(),
            content_type = artifact.content_type().unwrap_or("unknown"),
            "Run received"
        );

        let result = self.execute(&artifact, options, &mut ctx);

        let outcome = match result {
            Ok(completed) => {
                ctx.advance(RunStage::Rendered);
                Ok(completed)
            }
            Err(error) => {
                let stage = ctx.stage;
                ctx.advance(RunStage::Failed);
                Err(RunFailure {
                    stage,
                    modality: ctx.modality,
                    error,
                })
            }
        };

        let artifact_released = match artifact.release() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to release uploaded artifact");
                false
            }
        };

        let elapsed = ctx.started.elapsed();
        let modality = ctx.modality.map(|m| m.as_str()).unwrap_or("undetected");
        match &outcome {
            Ok(completed) => tracing::info!(
                modality,
                stage = RunStage::Rendered.as_str(),
                label = %completed.summary.predicted_class,
                explanation_available = completed.summary.explanation_available,
                report_id = %completed.report_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Pipeline run complete"
            ),
            Err(failure) => tracing::error!(
                modality,
                stage = failure.stage.as_str(),
                error_kind = failure.error.kind().as_str(),
                error = %failure.error,
                elapsed_ms = elapsed.as_millis() as u64,
                "Pipeline run failed"
            ),
        }

        PipelineRun {
            run_id: ctx.run_id,
            outcome,
            final_stage: ctx.stage,
            stages: ctx.timings,
            elapsed,
            artifact_released,
        }
    }

    fn execute(
        &self,
        artifact: &UploadedArtifact,
        options: RunOptions,
        ctx: &mut RunContext,
    ) -> Result<CompletedRun, PipelineError> {
        let bytes = artifact.read_bytes()?;

        // Detection
        ctx.advance(RunStage::Detecting);
        let modality = self
            .detector
            .detect_with_override(&bytes, options.modality_override)?;
        ctx.modality = Some(modality);

        // Modality-specific preparation
        let input = match modality {
            Modality::CtScan => {
                ctx.advance(RunStage::PreparingImage);
                PreparedInput::CtScan(self.preprocessor.prepare(&bytes)?)
            }
            Modality::TextReport => {
                ctx.advance(RunStage::ExtractingText);
                let text = self.extractor.extract(&bytes)?;
                let features = self.vectorizer.vectorize(&text);
                PreparedInput::TextReport { text, features }
            }
        };

        ctx.advance(RunStage::Inferring);
        let prediction = self.router.infer(modality, &input)?;

        // Explanation failures are absorbed into the outcome.
        ctx.advance(RunStage::Explaining);
        let explanation = self.explainer.explain(modality, &input, &prediction);

        ctx.advance(RunStage::Assembling);
        let source_image = match input {
            PreparedInput::CtScan(scan) => Some(scan.image),
            PreparedInput::TextReport { .. } => None,
        };
        let report = Report::assemble(prediction, explanation, source_image);
        let summary = report.summary()?;

        let (report_id, path) = self.store.allocate();
        let rendered = self.renderer.render(report, &path).inspect_err(|_| {
            self.store.discard(&report_id);
        })?;

        Ok(CompletedRun {
            report_id,
            summary,
            rendered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{LinearTextClassifier, MockCtModel, TfidfVectorizer};
    use crate::pipeline::ocr::MockOcrEngine;
    use crate::pipeline::preprocess::tests::make_test_png;
    use crate::pipeline::render::PdfReportRenderer;
    use crate::pipeline::ErrorKind;
    use std::collections::HashMap;
    use std::path::Path;

    struct FailingRenderer;

    impl ReportRenderer for FailingRenderer {
        fn render(&self, _report: Report, output: &Path) -> Result<RenderedReport, PipelineError> {
            std::fs::write(output, b"partial").unwrap();
            Err(PipelineError::RenderingFailure("Mock renderer failure".into()))
        }
    }

    fn text_oracles() -> (Arc<dyn TextVectorizer>, Arc<dyn TextClassifier>) {
        let vocab: HashMap<String, usize> = ["impression", "normal", "mass", "spiculated"]
            .iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), i))
            .collect();
        let vectorizer = TfidfVectorizer::from_parts(vocab, vec![1.0, 1.2, 1.5, 2.0]).unwrap();
        let classifier = LinearTextClassifier::new(
            vec!["Benign".into(), "Malignant".into(), "Normal".into()],
            vec![
                vec![0.0, -0.5, 0.5, 0.0],
                vec![0.0, -1.0, 1.5, 2.0],
                vec![0.2, 2.0, -1.0, -1.0],
            ],
            vec![0.0, 0.0, 0.0],
        )
        .unwrap();
        (Arc::new(vectorizer), Arc::new(classifier))
    }

    fn orchestrator_with(
        ocr: MockOcrEngine,
        model: MockCtModel,
        renderer: Box<dyn ReportRenderer>,
        dir: &Path,
    ) -> PipelineOrchestrator {
        let (vectorizer, text_classifier) = text_oracles();
        let oracles = Oracles {
            ocr: Arc::new(ocr),
            ct_model: Arc::new(model),
            ct_labels: Arc::new(CtLabelMap::reference()),
            vectorizer,
            text_classifier,
        };
        let settings = PipelineSettings {
            min_text_chars: 1,
            image_explainer: ExplainerConfig {
                num_samples: 20,
                ..ExplainerConfig::image_defaults()
            }
            .with_seed(1),
            text_explainer: ExplainerConfig {
                num_samples: 50,
                ..ExplainerConfig::text_defaults()
            }
            .with_seed(1),
        };
        let store = ReportStore::open(&dir.join("reports")).unwrap();
        PipelineOrchestrator::new(oracles, settings, renderer, store)
    }

    fn orchestrator(ocr: MockOcrEngine, model: MockCtModel, dir: &Path) -> PipelineOrchestrator {
        orchestrator_with(ocr, model, Box::new(PdfReportRenderer), dir)
    }

    fn stage(bytes: &[u8], dir: &Path) -> UploadedArtifact {
        UploadedArtifact::stage(bytes, Some("image/png"), &dir.join("uploads")).unwrap()
    }

    #[test]
    fn scenario_black_ct_scan_is_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(MockOcrEngine::new(""), MockCtModel::fixed(vec![0.1, 0.2, 0.7]), dir.path());
        let artifact = stage(&make_test_png(256, 256, [0, 0, 0]), dir.path());
        let upload_path = artifact.path().to_path_buf();

        let run = orch.run(artifact, RunOptions::default());

        assert_eq!(run.final_stage, RunStage::Rendered);
        assert!(run.artifact_released);
        assert!(!upload_path.exists());
        let completed = run.outcome.unwrap();
        assert_eq!(completed.summary.modality, Modality::CtScan);
        assert_eq!(completed.summary.predicted_class, "Normal");
        let p = completed.summary.probability.unwrap();
        assert!((0.0..=1.0).contains(&p));
        assert!(completed.rendered.path.exists());
        assert_eq!(&std::fs::read(&completed.rendered.path).unwrap()[..4], b"%PDF");
    }

    #[test]
    fn scenario_text_report_is_classified_and_explained() {
        let dir = tempfile::tempdir().unwrap();
        let text = "PATIENT: JOHN DOE, IMPRESSION: NORMAL";
        let orch = orchestrator(MockOcrEngine::new(text), MockCtModel::failing(), dir.path());
        let artifact = stage(&make_test_png(200, 100, [255, 255, 255]), dir.path());

        let run = orch.run(artifact, RunOptions::default());
        let completed = run.outcome.unwrap();

        assert_eq!(completed.summary.modality, Modality::TextReport);
        assert!(completed.summary.extracted_text.as_deref().unwrap().contains(text));
        assert!(["Benign", "Malignant", "Normal"].contains(&completed.summary.predicted_class.as_str()));
        assert_eq!(completed.summary.predicted_class, "Normal");
        assert!(completed.summary.probability.is_none());
        assert!(completed.summary.explanation_available);
        assert!(completed.summary.lime_explanation.is_some());
        assert_eq!(
            run.stages.iter().map(|t| t.stage).collect::<Vec<_>>(),
            vec![
                RunStage::Received,
                RunStage::Detecting,
                RunStage::ExtractingText,
                RunStage::Inferring,
                RunStage::Explaining,
                RunStage::Assembling,
            ]
        );
    }

    #[test]
    fn scenario_corrupt_bytes_fail_with_invalid_image_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(MockOcrEngine::new(""), MockCtModel::fixed(vec![0.3, 0.3, 0.4]), dir.path());
        let artifact = stage(&[0x13u8; 1024], dir.path());
        let upload_path = artifact.path().to_path_buf();

        let run = orch.run(artifact, RunOptions::default());

        assert_eq!(run.final_stage, RunStage::Failed);
        assert!(run.artifact_released);
        assert!(!upload_path.exists());
        let failure = run.outcome.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::InvalidImage);
        assert_eq!(failure.stage, RunStage::Detecting);
        assert!(failure.modality.is_none());
        assert_eq!(std::fs::read_dir(orch.store().dir()).unwrap().count(), 0);
    }

    #[test]
    fn scenario_explainer_failure_still_renders_with_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockCtModel::fixed(vec![0.6, 0.3, 0.1]).failing_after(1);
        let orch = orchestrator(MockOcrEngine::new(""), model, dir.path());
        let artifact = stage(&make_test_png(256, 256, [30, 30, 30]), dir.path());

        let run = orch.run(artifact, RunOptions::default());

        assert_eq!(run.final_stage, RunStage::Rendered);
        let completed = run.outcome.unwrap();
        assert_eq!(completed.summary.predicted_class, "Benign");
        assert!(!completed.summary.explanation_available);
        assert!(completed.summary.explanation_unavailable_reason.is_some());
        assert!(completed.summary.explanation_image.is_none());
        assert!(completed.rendered.path.exists());
    }

    #[test]
    fn inference_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(MockOcrEngine::new(""), MockCtModel::fixed(vec![0.5, 0.5]), dir.path());
        let run = orch.run(stage(&make_test_png(64, 64, [0, 0, 0]), dir.path()), RunOptions::default());

        let failure = run.outcome.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::InferenceFailure);
        assert_eq!(failure.stage, RunStage::Inferring);
        assert_eq!(failure.modality, Some(Modality::CtScan));
        assert!(run.artifact_released);
    }

    #[test]
    fn ocr_failure_is_fatal_at_detection() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(MockOcrEngine::failing(), MockCtModel::fixed(vec![1.0, 0.0, 0.0]), dir.path());
        let run = orch.run(stage(&make_test_png(64, 64, [0, 0, 0]), dir.path()), RunOptions::default());
        let failure = run.outcome.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::OcrFailure);
        assert_eq!(failure.stage, RunStage::Detecting);
    }

    #[test]
    fn rendering_failure_discards_partial_report() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_with(
            MockOcrEngine::new(""),
            MockCtModel::fixed(vec![0.2, 0.2, 0.6]),
            Box::new(FailingRenderer),
            dir.path(),
        );
        let run = orch.run(stage(&make_test_png(64, 64, [0, 0, 0]), dir.path()), RunOptions::default());

        let failure = run.outcome.unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::RenderingFailure);
        assert_eq!(failure.stage, RunStage::Assembling);
        assert_eq!(std::fs::read_dir(orch.store().dir()).unwrap().count(), 0);
        assert!(run.artifact_released);
    }

    #[test]
    fn override_routes_text_looking_scan_to_ct_path() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            MockOcrEngine::new("R"),
            MockCtModel::fixed(vec![0.1, 0.8, 0.1]),
            dir.path(),
        );
        let run = orch.run(
            stage(&make_test_png(64, 64, [0, 0, 0]), dir.path()),
            RunOptions {
                modality_override: Some(Modality::CtScan),
            },
        );
        let completed = run.outcome.unwrap();
        assert_eq!(completed.summary.modality, Modality::CtScan);
        assert_eq!(completed.summary.predicted_class, "Malignant");
    }

    #[test]
    fn empty_ocr_on_forced_text_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(MockOcrEngine::new("  "), MockCtModel::failing(), dir.path());
        let run = orch.run(
            stage(&make_test_png(64, 64, [255, 255, 255]), dir.path()),
            RunOptions {
                modality_override: Some(Modality::TextReport),
            },
        );
        let completed = run.outcome.unwrap();
        assert_eq!(completed.summary.extracted_text.as_deref(), Some(""));
        assert!(!completed.summary.explanation_available);
        assert_eq!(completed.summary.warnings.len(), 1);
    }

    #[test]
    fn concurrent_runs_share_oracles_safely() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Arc::new(orchestrator(
            MockOcrEngine::new(""),
            MockCtModel::fixed(vec![0.1, 0.2, 0.7]),
            dir.path(),
        ));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let orch = orch.clone();
                let uploads = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let artifact = stage(&make_test_png(64, 64, [i * 10, 0, 0]), &uploads);
                    orch.run(artifact, RunOptions::default())
                })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            let run = h.join().unwrap();
            assert!(run.artifact_released);
            ids.push(run.outcome.unwrap().report_id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn transition_table() {
        use RunStage::*;
        assert!(Received.can_transition_to(Detecting));
        assert!(Detecting.can_transition_to(PreparingImage));
        assert!(Detecting.can_transition_to(ExtractingText));
        assert!(Explaining.can_transition_to(Assembling));
        assert!(Inferring.can_transition_to(Failed));
        assert!(!Received.can_transition_to(Inferring));
        assert!(!PreparingImage.can_transition_to(ExtractingText));
        assert!(!Rendered.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Detecting));
    }

    #[test]
    fn elapsed_covers_stage_timings() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(MockOcrEngine::new(""), MockCtModel::fixed(vec![0.1, 0.2, 0.7]), dir.path());
        let run = orch.run(stage(&make_test_png(64, 64, [0, 0, 0]), dir.path()), RunOptions::default());
        let sum: Duration = run.stages.iter().map(|t| t.elapsed).sum();
        assert!(run.elapsed >= sum);
        assert_eq!(run.visited().last(), Some(&RunStage::Rendered));
    }
}
