//! TF-IDF vectorizer loaded from a JSON export of a fitted vocabulary.
//!
//! Export format (scikit-learn compatible semantics):
//! `{ "vocabulary": {"term": index, ...}, "idf": [...], "lowercase": true,
//!    "token_pattern": "(?u)\\b\\w\\w+\\b", "ngram_range": [1, 1],
//!    "sublinear_tf": false, "norm": "l2" }`

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use super::{read_json_asset, FeatureVector, OracleError, TextVectorizer};

const DEFAULT_TOKEN_PATTERN: &str = r"(?u)\b\w\w+\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L1,
    L2,
}

fn default_true() -> bool {
    true
}

fn default_norm() -> Option<Norm> {
    Some(Norm::L2)
}

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

#[derive(Debug, Deserialize)]
struct TfidfAsset {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    #[serde(default = "default_true")]
    lowercase: bool,
    #[serde(default)]
    token_pattern: Option<String>,
    #[serde(default = "default_ngram_range")]
    ngram_range: (usize, usize),
    #[serde(default)]
    sublinear_tf: bool,
    /// Missing → l2, explicit `null` → no normalization.
    #[serde(default = "default_norm")]
    norm: Option<Norm>,
}

#[derive(Debug)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    lowercase: bool,
    token_pattern: Regex,
    ngram_range: (usize, usize),
    sublinear_tf: bool,
    norm: Option<Norm>,
}

impl TfidfVectorizer {
    /// Unigram, lowercase, l2-normalized vectorizer from a vocabulary and idf table.
    pub fn from_parts(vocabulary: HashMap<String, usize>, idf: Vec<f32>) -> Result<Self, String> {
        Self::build(vocabulary, idf, true, None, (1, 1), false, Some(Norm::L2))
    }

    pub fn load(path: &Path) -> Result<Self, OracleError> {
        let asset: TfidfAsset = read_json_asset(path)?;
        let vectorizer = Self::build(
            asset.vocabulary,
            asset.idf,
            asset.lowercase,
            asset.token_pattern.as_deref(),
            asset.ngram_range,
            asset.sublinear_tf,
            asset.norm,
        )
        .map_err(|reason| OracleError::InvalidAsset {
            path: path.to_path_buf(),
            reason,
        })?;

        tracing::info!(
            path = %path.display(),
            vocabulary = vectorizer.vocabulary.len(),
            ngram_range = ?vectorizer.ngram_range,
            "TF-IDF vectorizer loaded"
        );
        Ok(vectorizer)
    }

    fn build(
        vocabulary: HashMap<String, usize>,
        idf: Vec<f32>,
        lowercase: bool,
        token_pattern: Option<&str>,
        ngram_range: (usize, usize),
        sublinear_tf: bool,
        norm: Option<Norm>,
    ) -> Result<Self, String> {
        if idf.is_empty() {
            return Err("idf table is empty".into());
        }
        if let Some((term, &index)) = vocabulary.iter().find(|(_, &i)| i >= idf.len()) {
            return Err(format!(
                "term {term:?} maps to index {index} beyond idf length {}",
                idf.len()
            ));
        }
        let (min_n, max_n) = ngram_range;
        if min_n == 0 || min_n > max_n {
            return Err(format!("invalid ngram_range ({min_n}, {max_n})"));
        }
        let token_pattern = Regex::new(token_pattern.unwrap_or(DEFAULT_TOKEN_PATTERN))
            .map_err(|e| format!("invalid token_pattern: {e}"))?;

        Ok(Self {
            vocabulary,
            idf,
            lowercase,
            token_pattern,
            ngram_range,
            sublinear_tf,
            norm,
        })
    }

    fn tokenize<'a>(&self, doc: &'a str) -> Vec<&'a str> {
        self.token_pattern
            .find_iter(doc)
            .map(|m| m.as_str())
            .collect()
    }
}

impl TextVectorizer for TfidfVectorizer {
    fn transform(&self, text: &str) -> FeatureVector {
        let doc = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };
        let tokens = self.tokenize(&doc);

        let mut counts: HashMap<usize, f32> = HashMap::new();
        let (min_n, max_n) = self.ngram_range;
        for n in min_n..=max_n {
            for window in tokens.windows(n) {
                let term = window.join(" ");
                if let Some(&index) = self.vocabulary.get(&term) {
                    *counts.entry(index).or_insert(0.0) += 1.0;
                }
            }
        }

        let mut entries: Vec<(usize, f32)> = counts
            .into_iter()
            .map(|(index, tf)| {
                let tf = if self.sublinear_tf { 1.0 + tf.ln() } else { tf };
                (index, tf * self.idf[index])
            })
            .collect();

        let norm = match self.norm {
            Some(Norm::L2) => entries.iter().map(|(_, v)| v * v).sum::<f32>().sqrt(),
            Some(Norm::L1) => entries.iter().map(|(_, v)| v.abs()).sum::<f32>(),
            None => 1.0,
        };
        if norm > 0.0 {
            for (_, v) in &mut entries {
                *v /= norm;
            }
        }

        FeatureVector::new(self.idf.len(), entries)
    }

    fn dimension(&self) -> usize {
        self.idf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(terms: &[&str]) -> HashMap<String, usize> {
        terms
            .iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), i))
            .collect()
    }

    #[test]
    fn transform_counts_known_terms_and_l2_normalizes() {
        let v = TfidfVectorizer::from_parts(vocab(&["nodule", "normal", "mass"]), vec![1.0, 1.0, 2.0])
            .unwrap();
        let fv = v.transform("Nodule nodule MASS, no other findings");
        assert_eq!(fv.dim(), 3);
        // nodule: 2*1, mass: 1*2 → both 2/sqrt(8)
        let expected = 2.0 / 8.0f32.sqrt();
        assert_eq!(fv.nnz(), 2);
        for &(i, val) in fv.entries() {
            assert!(i == 0 || i == 2);
            assert!((val - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn single_char_tokens_are_ignored_by_default_pattern() {
        let v = TfidfVectorizer::from_parts(vocab(&["a", "ct"]), vec![1.0, 1.0]).unwrap();
        let fv = v.transform("a CT");
        assert_eq!(fv.entries(), &[(1, 1.0)]);
    }

    #[test]
    fn empty_text_gives_empty_vector() {
        let v = TfidfVectorizer::from_parts(vocab(&["normal"]), vec![1.0]).unwrap();
        let fv = v.transform("");
        assert_eq!(fv.nnz(), 0);
        assert_eq!(fv.dim(), 1);
    }

    #[test]
    fn transform_is_repeatable() {
        let v = TfidfVectorizer::from_parts(vocab(&["impression", "normal"]), vec![1.5, 0.5]).unwrap();
        let a = v.transform("IMPRESSION: NORMAL");
        let b = v.transform("IMPRESSION: NORMAL");
        assert_eq!(a, b);
    }

    #[test]
    fn bigrams_and_unnormalized_sublinear_from_asset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tfidf.json");
        std::fs::write(
            &path,
            r#"{
                "vocabulary": {"ground glass": 0, "glass": 1},
                "idf": [2.0, 1.0],
                "ngram_range": [1, 2],
                "sublinear_tf": true,
                "norm": null
            }"#,
        )
        .unwrap();
        let v = TfidfVectorizer::load(&path).unwrap();
        let fv = v.transform("ground glass ground glass");
        // "ground glass" x2 → (1 + ln 2) * 2 ; "glass" x2 → (1 + ln 2) * 1
        let tf = 1.0 + 2.0f32.ln();
        assert!((fv.entries()[0].1 - tf * 2.0).abs() < 1e-5);
        assert!((fv.entries()[1].1 - tf).abs() < 1e-5);
    }

    #[test]
    fn load_rejects_index_beyond_idf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tfidf.json");
        std::fs::write(&path, r#"{"vocabulary": {"x": 4}, "idf": [1.0]}"#).unwrap();
        assert!(matches!(
            TfidfVectorizer::load(&path),
            Err(OracleError::InvalidAsset { .. })
        ));
    }

    #[test]
    fn invalid_ngram_range_rejected() {
        let err = TfidfVectorizer::build(vocab(&["x"]), vec![1.0], true, None, (2, 1), false, None);
        assert!(err.is_err());
    }
}
