//! Identity matching: the accept/reject decision.
//!
//! Both strategies reduce their candidates to a best and a second-best score
//! in one pass and then apply the same dual-threshold rule:
//!
//! 1. reject if `best < threshold`;
//! 2. reject if `second > 0` and `best - second < margin`;
//! 3. accept otherwise.
//!
//! The second rule is skipped entirely when the runner-up scored zero or
//! below, so a lone positive candidate only has to clear the threshold.

use crate::database::{DatabaseHandle, IdentityDatabase};
use crate::recognizer::EmbeddingError;
use crate::types::{Embedding, MatchResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;
pub const DEFAULT_MARGIN_THRESHOLD: f32 = 0.10;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("query has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid query vector: {0}")]
    InvalidQuery(EmbeddingError),
}

impl From<EmbeddingError> for MatchError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::DimensionMismatch { expected, actual } => {
                MatchError::DimensionMismatch { expected, actual }
            }
            other => MatchError::InvalidQuery(other),
        }
    }
}

/// Acceptance bar and minimum lead over the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub similarity: f32,
    pub margin: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            similarity: DEFAULT_SIMILARITY_THRESHOLD,
            margin: DEFAULT_MARGIN_THRESHOLD,
        }
    }
}

/// Which strategy resolves identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Cosine similarity against the identity database.
    #[default]
    Similarity,
    /// Closed-set classifier over a fixed class index.
    Classifier,
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "similarity" => Ok(MatchMode::Similarity),
            "classifier" => Ok(MatchMode::Classifier),
            other => Err(format!(
                "unknown match mode {other:?} (expected similarity or classifier)"
            )),
        }
    }
}

/// Strategy for turning a provider output into a decision.
pub trait MatchStrategy {
    fn mode(&self) -> MatchMode;

    /// Resolve one face from the raw provider output.
    ///
    /// Errors are fatal to this query only.
    fn identify(&self, output: &[f32]) -> Result<MatchResult, MatchError>;
}

/// Best and second-best candidates of a linear scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TopTwo<T> {
    pub best: Option<T>,
    pub best_score: f32,
    pub second_score: f32,
}

impl<T> TopTwo<T> {
    /// Track the top two scores without sorting. Both start at -1; ties keep
    /// the first candidate seen.
    pub fn scan(candidates: impl IntoIterator<Item = (T, f32)>) -> Self {
        let mut top = TopTwo {
            best: None,
            best_score: -1.0,
            second_score: -1.0,
        };
        for (candidate, score) in candidates {
            if score > top.best_score {
                top.second_score = top.best_score;
                top.best_score = score;
                top.best = Some(candidate);
            } else if score > top.second_score {
                top.second_score = score;
            }
        }
        top
    }
}

/// Apply the dual-threshold rule to a scan result.
pub(crate) fn decide<T: Into<String>>(top: TopTwo<T>, thresholds: &Thresholds) -> MatchResult {
    let TopTwo {
        best,
        best_score,
        second_score,
    } = top;

    if best_score < thresholds.similarity {
        return MatchResult::unknown(best_score);
    }

    if second_score > 0.0 && (best_score - second_score) < thresholds.margin {
        return MatchResult::unknown(best_score);
    }

    // No candidate ever beat the initial -1.
    match best {
        Some(name) => MatchResult::known(name, best_score),
        None => MatchResult::unknown(best_score),
    }
}

/// Match a normalized query against a database snapshot.
pub fn match_embedding(
    db: &IdentityDatabase,
    query: &Embedding,
    thresholds: &Thresholds,
) -> Result<MatchResult, MatchError> {
    let Some(dim) = db.dimension() else {
        return Ok(MatchResult::unknown(0.0));
    };
    if query.dim() != dim {
        return Err(MatchError::DimensionMismatch {
            expected: dim,
            actual: query.dim(),
        });
    }

    let top = TopTwo::scan(
        db.iter()
            .map(|record| (record.name.as_str(), query.similarity(&record.reference))),
    );

    tracing::debug!(
        best = ?top.best,
        best_score = top.best_score,
        second_score = top.second_score,
        "similarity scan"
    );

    Ok(decide(top, thresholds))
}

/// Cosine-similarity strategy over the current identity database.
pub struct SimilarityMatcher {
    database: Arc<DatabaseHandle>,
    thresholds: Thresholds,
}

impl SimilarityMatcher {
    pub fn new(database: Arc<DatabaseHandle>, thresholds: Thresholds) -> Self {
        Self {
            database,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}

impl MatchStrategy for SimilarityMatcher {
    fn mode(&self) -> MatchMode {
        MatchMode::Similarity
    }

    fn identify(&self, output: &[f32]) -> Result<MatchResult, MatchError> {
        let db = self.database.snapshot();
        let Some(dim) = db.dimension() else {
            return Ok(MatchResult::unknown(0.0));
        };
        let query = Embedding::from_raw(output.to_vec(), dim)?;
        match_embedding(&db, &query, &self.thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IdentityRecord, MatchLabel};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::from_raw(values.to_vec(), values.len()).unwrap()
    }

    fn db(records: &[(&str, &[f32])]) -> IdentityDatabase {
        IdentityDatabase::from_records(records.iter().map(|(name, v)| IdentityRecord {
            name: name.to_string(),
            reference: emb(v),
            sample_count: 1,
        }))
        .unwrap()
    }

    /// Unit vector in 3-D whose dot product with `[1, 0, 0]` is `cos`.
    fn at_cos(cos: f32, sign: f32) -> Vec<f32> {
        vec![cos, sign * (1.0 - cos * cos).sqrt(), 0.0]
    }

    fn top(best: Option<&str>, best_score: f32, second_score: f32) -> TopTwo<String> {
        TopTwo {
            best: best.map(String::from),
            best_score,
            second_score,
        }
    }

    #[test]
    fn test_empty_database_is_unknown() {
        let result = match_embedding(&IdentityDatabase::empty(), &emb(&[1.0, 2.0]), &Thresholds::default())
            .unwrap();
        assert_eq!(result, MatchResult::unknown(0.0));
    }

    #[test]
    fn test_single_identity_exact_match() {
        let d = db(&[("alen", &[0.2, 0.4, 0.9])]);
        let result = match_embedding(&d, &emb(&[0.2, 0.4, 0.9]), &Thresholds::default()).unwrap();
        assert_eq!(result.label, MatchLabel::Known("alen".into()));
        assert!((result.score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_ambiguous_pair_is_unknown() {
        // best 0.90 for A, second 0.88 for B: lead 0.02 < 0.10
        let result = decide(top(Some("A"), 0.90, 0.88), &Thresholds::default());
        assert!(result.is_unknown());
        assert!((result.score - 0.90).abs() < 1e-6);
    }

    #[test]
    fn test_clear_lead_is_accepted() {
        let result = decide(top(Some("A"), 0.95, 0.70), &Thresholds::default());
        assert_eq!(result, MatchResult::known("A", 0.95));
    }

    #[test]
    fn test_below_threshold_is_unknown_regardless_of_margin() {
        let result = decide(top(Some("A"), 0.80, -0.5), &Thresholds::default());
        assert_eq!(result, MatchResult::unknown(0.80));
    }

    #[test]
    fn test_margin_skipped_when_runner_up_not_positive() {
        let result = decide(top(Some("A"), 0.86, 0.0), &Thresholds::default());
        assert_eq!(result, MatchResult::known("A", 0.86));
        let result = decide(top(Some("A"), 0.86, -0.2), &Thresholds::default());
        assert_eq!(result, MatchResult::known("A", 0.86));
    }

    #[test]
    fn test_exact_thresholds_are_accepted() {
        let t = Thresholds { similarity: 0.5, margin: 0.25 };
        let result = decide(top(Some("A"), 0.75, 0.5), &t);
        assert_eq!(result, MatchResult::known("A", 0.75));
    }

    #[test]
    fn test_opposite_reference_is_unknown() {
        let d = db(&[("A", &[-1.0, 0.0])]);
        let result = match_embedding(&d, &emb(&[1.0, 0.0]), &Thresholds::default()).unwrap();
        assert!(result.is_unknown());
        assert!((result.score + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scan_tracks_top_two_in_one_pass() {
        let scan = TopTwo::scan(vec![("a", 0.3), ("b", 0.9), ("c", 0.5), ("d", 0.7)]);
        assert_eq!(scan.best, Some("b"));
        assert_eq!(scan.best_score, 0.9);
        assert_eq!(scan.second_score, 0.7);
    }

    #[test]
    fn test_scan_tie_keeps_first() {
        let scan = TopTwo::scan(vec![("a", 0.9), ("b", 0.9)]);
        assert_eq!(scan.best, Some("a"));
        assert_eq!(scan.second_score, 0.9);
    }

    #[test]
    fn test_database_ambiguous_pair() {
        let d = db(&[("A", &at_cos(0.90, 1.0)), ("B", &at_cos(0.88, -1.0))]);
        let result = match_embedding(&d, &emb(&[1.0, 0.0, 0.0]), &Thresholds::default()).unwrap();
        assert!(result.is_unknown());
        assert!((result.score - 0.90).abs() < 1e-4);
    }

    #[test]
    fn test_database_clear_lead() {
        let d = db(&[("A", &at_cos(0.95, 1.0)), ("B", &at_cos(0.70, -1.0))]);
        let result = match_embedding(&d, &emb(&[1.0, 0.0, 0.0]), &Thresholds::default()).unwrap();
        assert_eq!(result.label, MatchLabel::Known("A".into()));
        assert!((result.score - 0.95).abs() < 1e-4);
    }

    #[test]
    fn test_dimension_mismatch() {
        let d = db(&[("A", &[1.0, 0.0, 0.0])]);
        let err = match_embedding(&d, &emb(&[1.0, 0.0]), &Thresholds::default()).unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_similarity_matcher_normalizes_raw_output() {
        let handle = Arc::new(DatabaseHandle::new(db(&[("alen", &[0.0, 1.0, 0.0])])));
        let matcher = SimilarityMatcher::new(handle, Thresholds::default());
        let result = matcher.identify(&[0.0, 42.0, 0.0]).unwrap();
        assert_eq!(result.label, MatchLabel::Known("alen".into()));
        assert!((result.score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similarity_matcher_query_errors() {
        let handle = Arc::new(DatabaseHandle::new(db(&[("alen", &[0.0, 1.0, 0.0])])));
        let matcher = SimilarityMatcher::new(handle, Thresholds::default());
        assert!(matches!(
            matcher.identify(&[1.0; 5]),
            Err(MatchError::DimensionMismatch { expected: 3, actual: 5 })
        ));
        assert!(matches!(
            matcher.identify(&[0.0; 3]),
            Err(MatchError::InvalidQuery(EmbeddingError::Degenerate))
        ));
    }

    #[test]
    fn test_similarity_matcher_sees_published_database() {
        let handle = Arc::new(DatabaseHandle::default());
        let matcher = SimilarityMatcher::new(handle.clone(), Thresholds::default());
        assert_eq!(matcher.identify(&[1.0, 0.0]).unwrap(), MatchResult::unknown(0.0));

        handle.publish(db(&[("alen", &[1.0, 0.0])]));
        let result = matcher.identify(&[1.0, 0.0]).unwrap();
        assert_eq!(result.label, MatchLabel::Known("alen".into()));
    }

    #[test]
    fn test_match_mode_from_str() {
        assert_eq!("Similarity".parse::<MatchMode>().unwrap(), MatchMode::Similarity);
        assert_eq!("classifier".parse::<MatchMode>().unwrap(), MatchMode::Classifier);
        assert!("knn".parse::<MatchMode>().is_err());
    }
}
