//! Per-face recognition: embed → match → ledger.

use crate::ledger::UnknownFaceLedger;
use crate::matcher::{MatchError, MatchStrategy};
use crate::recognizer::{EmbeddingError, EmbeddingProvider};
use crate::types::MatchResult;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("match failed: {0}")]
    Match(#[from] MatchError),
}

/// Resolves face crops one at a time with injected collaborators.
pub struct Recognizer {
    provider: Box<dyn EmbeddingProvider>,
    strategy: Box<dyn MatchStrategy>,
    ledger: Option<UnknownFaceLedger>,
}

impl Recognizer {
    pub fn new(provider: Box<dyn EmbeddingProvider>, strategy: Box<dyn MatchStrategy>) -> Self {
        Self {
            provider,
            strategy,
            ledger: None,
        }
    }

    /// Record every rejected face in `ledger`.
    pub fn with_ledger(mut self, ledger: UnknownFaceLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn strategy(&self) -> &dyn MatchStrategy {
        self.strategy.as_ref()
    }

    /// Resolve one face crop.
    ///
    /// An error means this face produced no identification; the recognizer
    /// stays usable. Ledger failures are logged and never returned.
    pub fn recognize(&mut self, face: &RgbImage) -> Result<MatchResult, RecognizeError> {
        let output = self.provider.embed(face)?;
        let result = self.strategy.identify(&output)?;

        tracing::debug!(
            mode = ?self.strategy.mode(),
            label = %result.label,
            score = result.score,
            "face resolved"
        );

        if result.is_unknown() {
            self.log_rejection(face, result.score);
        }
        Ok(result)
    }

    fn log_rejection(&self, face: &RgbImage, score: f32) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(err) = ledger.log_rejection(face, score) {
            tracing::warn!(error = %err, "unknown-face ledger write failed; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::ColorEmbedder;
    use crate::database::{DatabaseHandle, IdentityDatabase};
    use crate::matcher::{SimilarityMatcher, Thresholds};
    use crate::types::{Embedding, IdentityRecord, MatchLabel};
    use image::Rgb;
    use std::sync::Arc;

    fn recognizer() -> Recognizer {
        let db = IdentityDatabase::from_records(vec![IdentityRecord {
            name: "alen".into(),
            reference: Embedding::from_raw(vec![1.0, 0.0, 0.0], 3).unwrap(),
            sample_count: 4,
        }])
        .unwrap();
        let matcher = SimilarityMatcher::new(Arc::new(DatabaseHandle::new(db)), Thresholds::default());
        Recognizer::new(Box::new(ColorEmbedder), Box::new(matcher))
    }

    #[test]
    fn test_known_face_is_not_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = UnknownFaceLedger::new(tmp.path());
        let mut r = recognizer().with_ledger(ledger.clone());

        let result = r.recognize(&RgbImage::from_pixel(4, 4, Rgb([220, 5, 5]))).unwrap();
        assert_eq!(result.label, MatchLabel::Known("alen".into()));
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_face_is_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = UnknownFaceLedger::new(tmp.path());
        let mut r = recognizer().with_ledger(ledger.clone());

        let result = r.recognize(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 200]))).unwrap();
        assert!(result.is_unknown());
        let entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].image_path.exists());
    }

    #[test]
    fn test_ledger_failure_does_not_abort_recognition() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let mut r = recognizer().with_ledger(UnknownFaceLedger::new(&blocker));

        let result = r.recognize(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 200]))).unwrap();
        assert!(result.is_unknown());
    }

    #[test]
    fn test_degenerate_query_fails_only_that_face() {
        let mut r = recognizer();
        let err = r.recognize(&RgbImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, RecognizeError::Match(MatchError::InvalidQuery(_))));

        let result = r.recognize(&RgbImage::from_pixel(4, 4, Rgb([220, 5, 5]))).unwrap();
        assert!(!result.is_unknown());
    }
}
