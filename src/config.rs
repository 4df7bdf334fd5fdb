use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::explain::{ExplainerConfig, MAX_PERTURBATION_SAMPLES};
use crate::pipeline::orchestrator::PipelineSettings;
use crate::pipeline::store::DEFAULT_REPORT_TTL;

/// Application-level constants
pub const APP_NAME: &str = "MedRead";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default upload ceiling: 50 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

const ENV_PREFIX: &str = "MEDREAD_";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,medread_lib=debug,tower_http=info"
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{var}: must be greater than zero")]
    Zero { var: String },

    #[error("{var}: {value} exceeds the maximum of {max}")]
    TooLarge { var: String, value: usize, max: usize },
}

/// Runtime configuration, read once at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    /// Holds `ct_model.onnx`, `ct_labels.json`, `text_classifier.json`
    /// and `tfidf_vectorizer.json`.
    pub model_dir: PathBuf,
    /// Parent of `uploads/` and `reports/`.
    pub work_dir: PathBuf,
    pub tesseract: PathBuf,
    pub ocr_lang: String,
    pub image_samples: usize,
    pub image_features: usize,
    pub image_top_labels: usize,
    pub text_samples: usize,
    pub text_features: usize,
    pub min_text_chars: usize,
    pub max_upload_bytes: usize,
    /// How long an undownloaded report is kept.
    pub report_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let image = ExplainerConfig::image_defaults();
        let text = ExplainerConfig::text_defaults();
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            model_dir: PathBuf::from("models"),
            work_dir: std::env::temp_dir().join("medread"),
            tesseract: PathBuf::from("tesseract"),
            ocr_lang: "eng".into(),
            image_samples: image.num_samples,
            image_features: image.num_features,
            image_top_labels: image.top_labels,
            text_samples: text.num_samples,
            text_features: text.num_features,
            min_text_chars: 1,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            report_ttl: DEFAULT_REPORT_TTL,
        }
    }
}

impl ServiceConfig {
    /// Read `MEDREAD_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; set-but-invalid ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let defaults = Self::default();

        Ok(Self {
            bind: vars.parsed("BIND")?.unwrap_or(defaults.bind),
            model_dir: vars.path("MODEL_DIR").unwrap_or(defaults.model_dir),
            work_dir: vars.path("WORK_DIR").unwrap_or(defaults.work_dir),
            tesseract: vars.path("TESSERACT").unwrap_or(defaults.tesseract),
            ocr_lang: vars.string("OCR_LANG").unwrap_or(defaults.ocr_lang),
            image_samples: vars
                .count_at_most("IMAGE_SAMPLES", MAX_PERTURBATION_SAMPLES)?
                .unwrap_or(defaults.image_samples),
            image_features: vars.count("IMAGE_FEATURES")?.unwrap_or(defaults.image_features),
            image_top_labels: vars
                .count("IMAGE_TOP_LABELS")?
                .unwrap_or(defaults.image_top_labels),
            text_samples: vars
                .count_at_most("TEXT_SAMPLES", MAX_PERTURBATION_SAMPLES)?
                .unwrap_or(defaults.text_samples),
            text_features: vars.count("TEXT_FEATURES")?.unwrap_or(defaults.text_features),
            min_text_chars: vars.count("MIN_TEXT_CHARS")?.unwrap_or(defaults.min_text_chars),
            max_upload_bytes: vars
                .count("MAX_UPLOAD_BYTES")?
                .unwrap_or(defaults.max_upload_bytes),
            report_ttl: vars
                .count("REPORT_TTL_SECS")?
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(defaults.report_ttl),
        })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.work_dir.join("uploads")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.work_dir.join("reports")
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_text_chars: self.min_text_chars,
            image_explainer: ExplainerConfig {
                num_samples: self.image_samples,
                num_features: self.image_features,
                top_labels: self.image_top_labels,
                ..ExplainerConfig::image_defaults()
            },
            text_explainer: ExplainerConfig {
                num_samples: self.text_samples,
                num_features: self.text_features,
                ..ExplainerConfig::text_defaults()
            },
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = format!("{ENV_PREFIX}{name}");
        let value = (self.lookup)(&var)?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return None;
        }
        Some((var, value))
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, v)| v)
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.string(name).map(PathBuf::from)
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(name) {
            None => Ok(None),
            Some((var, value)) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                }),
        }
    }

    /// Positive integer.
    fn count(&self, name: &str) -> Result<Option<usize>, ConfigError> {
        match self.parsed::<usize>(name)? {
            Some(0) => Err(ConfigError::Zero {
                var: format!("{ENV_PREFIX}{name}"),
            }),
            other => Ok(other),
        }
    }

    fn count_at_most(&self, name: &str, max: usize) -> Result<Option<usize>, ConfigError> {
        match self.count(name)? {
            Some(value) if value > max => Err(ConfigError::TooLarge {
                var: format!("{ENV_PREFIX}{name}"),
                value,
                max,
            }),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.bind.port(), 5000);
        assert_eq!(config.image_samples, 1000);
        assert_eq!(config.text_samples, 500);
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.report_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("MEDREAD_BIND", "127.0.0.1:8080"),
            ("MEDREAD_MODEL_DIR", "/opt/models"),
            ("MEDREAD_IMAGE_SAMPLES", "200"),
            ("MEDREAD_OCR_LANG", "eng+fra"),
            ("MEDREAD_REPORT_TTL_SECS", "90"),
        ])
        .unwrap();
        assert_eq!(config.report_ttl, Duration::from_secs(90));
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.image_samples, 200);
        assert_eq!(config.ocr_lang, "eng+fra");
    }

    #[test]
    fn invalid_value_names_variable() {
        let err = from_pairs(&[("MEDREAD_TEXT_SAMPLES", "many")]).unwrap_err();
        assert!(err.to_string().starts_with("MEDREAD_TEXT_SAMPLES"));
    }

    #[test]
    fn zero_count_rejected() {
        let err = from_pairs(&[("MEDREAD_MAX_UPLOAD_BYTES", "0")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Zero {
                var: "MEDREAD_MAX_UPLOAD_BYTES".into()
            }
        );
    }

    #[test]
    fn sample_budget_above_ceiling_rejected() {
        let err = from_pairs(&[("MEDREAD_IMAGE_SAMPLES", "10001")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::TooLarge {
                var: "MEDREAD_IMAGE_SAMPLES".into(),
                value: 10_001,
                max: MAX_PERTURBATION_SAMPLES,
            }
        );
        let config = from_pairs(&[("MEDREAD_TEXT_SAMPLES", "10000")]).unwrap();
        assert_eq!(config.text_samples, MAX_PERTURBATION_SAMPLES);
    }

    #[test]
    fn blank_value_falls_back_to_default() {
        let config = from_pairs(&[("MEDREAD_TESSERACT", "  ")]).unwrap();
        assert_eq!(config.tesseract, PathBuf::from("tesseract"));
    }

    #[test]
    fn work_subdirectories() {
        let config = from_pairs(&[("MEDREAD_WORK_DIR", "/var/medread")]).unwrap();
        assert_eq!(config.uploads_dir(), PathBuf::from("/var/medread/uploads"));
        assert_eq!(config.reports_dir(), PathBuf::from("/var/medread/reports"));
    }

    #[test]
    fn pipeline_settings_carry_explainer_budgets() {
        let config = from_pairs(&[
            ("MEDREAD_IMAGE_TOP_LABELS", "2"),
            ("MEDREAD_TEXT_FEATURES", "6"),
        ])
        .unwrap();
        let settings = config.pipeline_settings();
        assert_eq!(settings.image_explainer.top_labels, 2);
        assert_eq!(settings.image_explainer.kernel_width, 0.25);
        assert_eq!(settings.text_explainer.num_features, 6);
        assert_eq!(settings.text_explainer.kernel_width, 25.0);
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
