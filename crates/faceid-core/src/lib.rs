//! faceid-core — Embedding-based identity resolution.
//!
//! Builds an identity database from an enrollment corpus, matches face
//! embeddings against it with a dual-threshold policy, stages new
//! enrollments and records rejected faces in an append-only ledger.

pub mod classifier;
pub mod database;
pub mod detector;
pub mod enrollment;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use classifier::{ClassIndex, ClassifierMatcher};
pub use database::{BuildReport, DatabaseBuilder, DatabaseHandle, IdentityDatabase};
pub use detector::FaceDetector;
pub use enrollment::{CaptureSchedule, EnrollmentPipeline};
pub use ledger::{LedgerEntry, UnknownFaceLedger};
pub use matcher::{MatchMode, MatchStrategy, SimilarityMatcher, Thresholds};
pub use pipeline::Recognizer;
pub use recognizer::{EmbeddingProvider, OnnxEmbedder};
pub use types::{BoundingBox, Embedding, IdentityRecord, MatchLabel, MatchResult};
