use crate::recognizer::EmbeddingError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Norms below this are treated as degenerate rather than divided by.
pub const NORM_EPSILON: f32 = 1e-6;

/// Allowed deviation from unit length for stored and query embeddings.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-4;

/// Label reported for every rejected face.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Bounding box for a detected face, in pixel coordinates of the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }
}

/// L2-normalized face embedding.
///
/// The only constructors normalize their input, so every value of this type
/// satisfies `|norm - 1| <= UNIT_NORM_TOLERANCE`.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Validate and normalize a raw provider output.
    ///
    /// Fails when the length differs from `expected_dim`, when any component is
    /// not finite, or when the norm is too small to divide by.
    pub fn from_raw(values: Vec<f32>, expected_dim: usize) -> Result<Self, EmbeddingError> {
        if values.len() != expected_dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: expected_dim,
                actual: values.len(),
            });
        }
        Self::normalize(values)
    }

    /// Normalized mean of a set of embeddings of equal dimension.
    pub fn mean(samples: &[Embedding]) -> Result<Self, EmbeddingError> {
        let first = samples.first().ok_or(EmbeddingError::Degenerate)?;
        let dim = first.dim();

        let mut sum = vec![0.0f32; dim];
        for sample in samples {
            if sample.dim() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    actual: sample.dim(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }

        let n = samples.len() as f32;
        Self::normalize(sum.into_iter().map(|v| v / n).collect())
    }

    fn normalize(mut values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < NORM_EPSILON {
            return Err(EmbeddingError::Degenerate);
        }
        for v in values.iter_mut() {
            *v /= norm;
        }
        Ok(Self { values })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1]. Both sides are unit length, so this is
    /// the dot product.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }
}

/// One enrolled identity. Replaced wholesale on every database rebuild.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub name: String,
    pub reference: Embedding,
    pub sample_count: usize,
}

/// Outcome label of a match: a database key or the reserved unknown label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MatchLabel {
    Known(String),
    Unknown,
}

impl MatchLabel {
    pub fn as_str(&self) -> &str {
        match self {
            MatchLabel::Known(name) => name,
            MatchLabel::Unknown => UNKNOWN_LABEL,
        }
    }
}

impl fmt::Display for MatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MatchLabel> for String {
    fn from(label: MatchLabel) -> Self {
        match label {
            MatchLabel::Known(name) => name,
            MatchLabel::Unknown => UNKNOWN_LABEL.to_string(),
        }
    }
}

impl From<String> for MatchLabel {
    fn from(s: String) -> Self {
        if s == UNKNOWN_LABEL {
            MatchLabel::Unknown
        } else {
            MatchLabel::Known(s)
        }
    }
}

/// Result of resolving one face. Ephemeral; only rejected results are persisted
/// (through the unknown-face ledger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub label: MatchLabel,
    /// Best score seen, in [-1, 1] for similarity and [0, 1] for the classifier.
    pub score: f32,
}

impl MatchResult {
    pub fn unknown(score: f32) -> Self {
        Self {
            label: MatchLabel::Unknown,
            score,
        }
    }

    pub fn known(name: impl Into<String>, score: f32) -> Self {
        Self {
            label: MatchLabel::Known(name.into()),
            score,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label == MatchLabel::Unknown
    }
}

/// Check that a name can be used as an identity key and as a directory name.
pub fn validate_identity_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("identity name is empty".into());
    }
    if name != name.trim() {
        return Err(format!("identity name {name:?} has surrounding whitespace"));
    }
    if name == UNKNOWN_LABEL {
        return Err(format!("{UNKNOWN_LABEL:?} is reserved for rejected faces"));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(format!("identity name {name:?} is not a plain directory name"));
    }
    Ok(())
}
