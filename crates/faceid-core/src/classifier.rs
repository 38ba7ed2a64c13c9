//! Closed-set classifier strategy.
//!
//! The model's final layer scores a fixed list of classes; a [`ClassIndex`]
//! maps each output slot back to an identity name. Decisions use the same
//! dual-threshold rule as similarity matching.

use crate::matcher::{decide, MatchError, MatchMode, MatchStrategy, Thresholds, TopTwo};
use crate::recognizer::EmbeddingError;
use crate::types::{validate_identity_name, MatchResult};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CLASSIFIER_THRESHOLD: f32 = 0.70;

/// Slots without a name tolerated beyond the number of named classes.
pub const MAX_UNNAMED_SLOTS: usize = 64;

#[derive(Error, Debug)]
pub enum ClassIndexError {
    #[error("failed to read class index {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid class index JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("slot {slot} is assigned to both {first} and {second}")]
    DuplicateSlot {
        slot: usize,
        first: String,
        second: String,
    },
    #[error("invalid class name: {0}")]
    InvalidName(String),
    #[error("slot {slot} of {name} is out of range for {classes} classes")]
    SlotOutOfRange {
        name: String,
        slot: usize,
        classes: usize,
    },
}

/// Name → output slot mapping of a classifier model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndex {
    by_slot: Vec<Option<String>>,
}

impl ClassIndex {
    /// Load a `{"name": slot, ...}` JSON object.
    pub fn load(path: &Path) -> Result<Self, ClassIndexError> {
        let text = std::fs::read_to_string(path).map_err(|source| ClassIndexError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ClassIndexError> {
        let map: BTreeMap<String, usize> = serde_json::from_str(text)?;
        Self::from_map(map)
    }

    pub fn from_map(map: BTreeMap<String, usize>) -> Result<Self, ClassIndexError> {
        let classes = map.len();
        let slot_limit = classes.saturating_add(MAX_UNNAMED_SLOTS);
        let mut by_slot: Vec<Option<String>> = Vec::new();
        for (name, slot) in map {
            validate_identity_name(&name).map_err(ClassIndexError::InvalidName)?;
            let needed = match slot.checked_add(1) {
                Some(n) if n <= slot_limit => n,
                _ => return Err(ClassIndexError::SlotOutOfRange { name, slot, classes }),
            };
            if needed > by_slot.len() {
                by_slot.resize(needed, None);
            }
            if let Some(first) = &by_slot[slot] {
                return Err(ClassIndexError::DuplicateSlot {
                    slot,
                    first: first.clone(),
                    second: name,
                });
            }
            by_slot[slot] = Some(name);
        }
        Ok(Self { by_slot })
    }

    /// Number of model outputs covered: highest slot + 1.
    pub fn class_count(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }

    pub fn name(&self, slot: usize) -> Option<&str> {
        self.by_slot.get(slot).and_then(|n| n.as_deref())
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Classifier strategy over a fixed class list.
pub struct ClassifierMatcher {
    index: ClassIndex,
    thresholds: Thresholds,
    /// Apply softmax to the model output before deciding.
    logits: bool,
}

impl ClassifierMatcher {
    pub fn new(index: ClassIndex, thresholds: Thresholds) -> Self {
        Self {
            index,
            thresholds,
            logits: false,
        }
    }

    /// Treat the model output as raw logits instead of probabilities.
    pub fn with_logits(mut self, logits: bool) -> Self {
        self.logits = logits;
        self
    }

    pub fn index(&self) -> &ClassIndex {
        &self.index
    }
}

impl MatchStrategy for ClassifierMatcher {
    fn mode(&self) -> MatchMode {
        MatchMode::Classifier
    }

    fn identify(&self, output: &[f32]) -> Result<MatchResult, MatchError> {
        if self.index.is_empty() {
            return Ok(MatchResult::unknown(0.0));
        }
        if output.len() != self.index.class_count() {
            return Err(MatchError::DimensionMismatch {
                expected: self.index.class_count(),
                actual: output.len(),
            });
        }
        if output.iter().any(|v| !v.is_finite()) {
            return Err(MatchError::InvalidQuery(EmbeddingError::NonFinite));
        }

        let probs = if self.logits {
            softmax(output)
        } else {
            output.to_vec()
        };

        let slots = TopTwo::scan(probs.iter().copied().enumerate());
        tracing::debug!(
            slot = ?slots.best,
            best_score = slots.best_score,
            second_score = slots.second_score,
            "classifier scan"
        );

        // An unnamed slot can never be reported as a known identity.
        let named = TopTwo {
            best: slots
                .best
                .and_then(|slot| self.index.name(slot))
                .map(str::to_owned),
            best_score: slots.best_score,
            second_score: slots.second_score,
        };

        Ok(decide(named, &self.thresholds))
    }
}
