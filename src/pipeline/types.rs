use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Which of the two supported upload kinds an image represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    CtScan,
    TextReport,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CtScan => "ct_scan",
            Self::TextReport => "text_report",
        }
    }

    /// Human-facing name used in responses and rendered reports.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::CtScan => "CT scan",
            Self::TextReport => "Text report",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ct_scan" | "ct" | "ct scan" => Some(Self::CtScan),
            "text_report" | "text" | "text report" => Some(Self::TextReport),
            _ => None,
        }
    }
}

/// Normalized model output shared by both inference paths.
///
/// Fields are private: the constructors are the only way to build one, which
/// keeps `confidence` present iff CT and `raw_text` present iff text report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    modality: Modality,
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_text: Option<String>,
}

impl Prediction {
    /// `confidence` is clamped into [0, 1]; the router rejects scores outside it.
    pub fn ct_scan(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            modality: Modality::CtScan,
            label: label.into(),
            confidence: Some(confidence.clamp(0.0, 1.0)),
            raw_text: None,
        }
    }

    pub fn text_report(label: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            modality: Modality::TextReport,
            label: label.into(),
            confidence: None,
            raw_text: Some(raw_text.into()),
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    pub fn raw_text(&self) -> Option<&str> {
        self.raw_text.as_deref()
    }
}

/// One token of a text explanation. Positive weights push toward the
/// explained class, negative weights away from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenWeight {
    pub token: String,
    pub weight: f64,
}

/// Weight of one image segment in the local surrogate model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionWeight {
    pub segment: usize,
    pub weight: f64,
}

/// Boundary-marked overlay highlighting the positively contributing regions.
#[derive(Debug, Clone)]
pub struct RegionOverlay {
    pub overlay: RgbImage,
    pub explained_label: String,
    /// Ranked by absolute weight, strongest first.
    pub regions: Vec<RegionWeight>,
    /// Weighted R² of the local surrogate.
    pub surrogate_score: f64,
}

#[derive(Debug, Clone)]
pub enum Explanation {
    RegionHighlight(RegionOverlay),
    /// Ranked by absolute weight, strongest first.
    TokenWeights(Vec<TokenWeight>),
}

impl Explanation {
    /// The modality this explanation variant belongs to.
    pub fn modality(&self) -> Modality {
        match self {
            Self::RegionHighlight(_) => Modality::CtScan,
            Self::TokenWeights(_) => Modality::TextReport,
        }
    }
}

/// Explicit outcome of the explanation stage. The unavailable case carries
/// the reason instead of an error so it never crosses the orchestrator as one.
#[derive(Debug, Clone)]
pub enum ExplanationOutcome {
    Computed(Explanation),
    Unavailable { reason: String },
}

impl ExplanationOutcome {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Computed(_))
    }

    pub fn explanation(&self) -> Option<&Explanation> {
        match self {
            Self::Computed(explanation) => Some(explanation),
            Self::Unavailable { .. } => None,
        }
    }
}
