//! Identity database: one reference embedding per enrolled identity.
//!
//! Built by scanning an enrollment corpus (one directory per identity) and
//! averaging the sample embeddings. A database is immutable once built; a
//! rebuild produces a new one which [`DatabaseHandle`] publishes atomically.

use crate::detector::{crop_face, largest_face, FaceDetector};
use crate::recognizer::EmbeddingProvider;
use crate::types::{validate_identity_name, Embedding, IdentityRecord};
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Image extensions picked up from an identity directory.
pub const SAMPLE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("invalid identity name: {0}")]
    InvalidName(String),
    #[error("identity {name} has {actual}-dim reference, database uses {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("identity {0} has no samples")]
    NoSamples(String),
}

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("corpus directory not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Name → reference embedding mapping.
#[derive(Debug, Clone, Default)]
pub struct IdentityDatabase {
    records: BTreeMap<String, IdentityRecord>,
    dimension: Option<usize>,
}

impl IdentityDatabase {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble a database from complete records.
    pub fn from_records(
        records: impl IntoIterator<Item = IdentityRecord>,
    ) -> Result<Self, DatabaseError> {
        let mut db = Self::default();
        for record in records {
            validate_identity_name(&record.name).map_err(DatabaseError::InvalidName)?;
            if record.sample_count == 0 {
                return Err(DatabaseError::NoSamples(record.name));
            }
            let dim = record.reference.dim();
            match db.dimension {
                Some(expected) if expected != dim => {
                    return Err(DatabaseError::DimensionMismatch {
                        name: record.name,
                        expected,
                        actual: dim,
                    });
                }
                _ => db.dimension = Some(dim),
            }
            if db.records.contains_key(&record.name) {
                return Err(DatabaseError::DuplicateIdentity(record.name));
            }
            db.records.insert(record.name.clone(), record);
        }
        Ok(db)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Shared dimension of all references; `None` for an empty database.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn get(&self, name: &str) -> Option<&IdentityRecord> {
        self.records.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values()
    }
}

/// Holder of the current database for a recognition session.
///
/// Readers take a [`snapshot`](Self::snapshot) and keep using it for the whole
/// query; [`publish`](Self::publish) replaces the pointer in one step.
#[derive(Debug, Default)]
pub struct DatabaseHandle {
    current: RwLock<Arc<IdentityDatabase>>,
}

impl DatabaseHandle {
    pub fn new(db: IdentityDatabase) -> Self {
        Self {
            current: RwLock::new(Arc::new(db)),
        }
    }

    pub fn snapshot(&self) -> Arc<IdentityDatabase> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new database, returning the previous one.
    pub fn publish(&self, db: IdentityDatabase) -> Arc<IdentityDatabase> {
        let next = Arc::new(db);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            previous = guard.len(),
            identities = next.len(),
            "identity database published"
        );
        std::mem::replace(&mut *guard, next)
    }

    /// Rebuild from a corpus and publish the result.
    pub fn rebuild(&self, builder: &mut DatabaseBuilder<'_>, corpus: &Path) -> BuildReport {
        let (db, report) = builder.build(corpus);
        self.publish(db);
        report
    }
}

/// One identity directory of the enrollment corpus.
#[derive(Debug)]
pub struct CorpusIdentity {
    pub name: String,
    /// Sample images, or the error listing this identity's directory.
    pub samples: Result<Vec<PathBuf>, CorpusError>,
}

/// List identity directories and their sample images, both in sorted order.
///
/// Only an unreadable corpus root is an error; an identity directory that
/// cannot be listed carries its error in [`CorpusIdentity::samples`].
pub fn scan_corpus(root: &Path) -> Result<Vec<CorpusIdentity>, CorpusError> {
    if !root.is_dir() {
        return Err(CorpusError::Missing(root.to_path_buf()));
    }

    let mut identities = Vec::new();
    for entry in read_dir_sorted(root)? {
        if !entry.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %entry.display(), "skipping non UTF-8 identity directory");
            continue;
        };

        let samples = read_dir_sorted(&entry).map(|paths| {
            paths
                .into_iter()
                .filter(|p| p.is_file() && has_sample_extension(p))
                .collect()
        });

        identities.push(CorpusIdentity {
            name: name.to_string(),
            samples,
        });
    }
    Ok(identities)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    let io_err = |source| CorpusError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}

fn has_sample_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SAMPLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrolledIdentity {
    pub name: String,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSample {
    pub identity: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OmittedIdentity {
    pub name: String,
    pub reason: String,
}

/// What a build did with every identity and sample of the corpus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub corpus: PathBuf,
    /// Set when the corpus could not be listed; the database is then empty.
    pub corpus_error: Option<String>,
    pub enrolled: Vec<EnrolledIdentity>,
    pub skipped_samples: Vec<SkippedSample>,
    pub omitted: Vec<OmittedIdentity>,
}

/// Builds an [`IdentityDatabase`] from an enrollment corpus.
pub struct DatabaseBuilder<'a> {
    provider: &'a mut dyn EmbeddingProvider,
    detector: Option<&'a mut dyn FaceDetector>,
}

impl<'a> DatabaseBuilder<'a> {
    /// Samples are assumed to be face crops already.
    pub fn new(provider: &'a mut dyn EmbeddingProvider) -> Self {
        Self {
            provider,
            detector: None,
        }
    }

    /// Run the detector on every sample and embed the largest face found.
    pub fn with_detector(mut self, detector: &'a mut dyn FaceDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Scan `corpus` and build a database. Never fails: problems are logged
    /// and collected in the report.
    pub fn build(&mut self, corpus: &Path) -> (IdentityDatabase, BuildReport) {
        let mut report = BuildReport {
            corpus: corpus.to_path_buf(),
            ..Default::default()
        };

        tracing::info!(corpus = %corpus.display(), "building identity database");

        let identities = match scan_corpus(corpus) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "cannot read enrollment corpus; database is empty");
                report.corpus_error = Some(e.to_string());
                return (IdentityDatabase::empty(), report);
            }
        };

        let db = self.build_from_identities(identities, &mut report);
        (db, report)
    }

    /// Build from already-scanned identities, recording problems in `report`.
    pub fn build_from_identities(
        &mut self,
        identities: Vec<CorpusIdentity>,
        report: &mut BuildReport,
    ) -> IdentityDatabase {
        let mut records = Vec::new();
        for identity in identities {
            if let Err(reason) = validate_identity_name(&identity.name) {
                tracing::warn!(name = %identity.name, %reason, "skipping identity directory");
                report.omitted.push(OmittedIdentity {
                    name: identity.name,
                    reason,
                });
                continue;
            }

            let samples = match identity.samples {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!(name = %identity.name, error = %e, "cannot list identity directory; identity omitted");
                    report.omitted.push(OmittedIdentity {
                        name: identity.name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut embeddings = Vec::with_capacity(samples.len());
            for path in &samples {
                match self.embed_sample(path) {
                    Ok(e) => embeddings.push(e),
                    Err(reason) => {
                        tracing::warn!(
                            name = %identity.name,
                            path = %path.display(),
                            %reason,
                            "skipping sample"
                        );
                        report.skipped_samples.push(SkippedSample {
                            identity: identity.name.clone(),
                            path: path.clone(),
                            reason,
                        });
                    }
                }
            }

            if embeddings.is_empty() {
                tracing::warn!(name = %identity.name, "no usable samples; identity omitted");
                report.omitted.push(OmittedIdentity {
                    name: identity.name,
                    reason: "no usable samples".into(),
                });
                continue;
            }

            match Embedding::mean(&embeddings) {
                Ok(reference) => {
                    tracing::info!(
                        name = %identity.name,
                        samples = embeddings.len(),
                        "identity added"
                    );
                    report.enrolled.push(EnrolledIdentity {
                        name: identity.name.clone(),
                        samples: embeddings.len(),
                    });
                    records.push(IdentityRecord {
                        name: identity.name,
                        reference,
                        sample_count: embeddings.len(),
                    });
                }
                Err(e) => {
                    tracing::warn!(name = %identity.name, error = %e, "cannot average samples; identity omitted");
                    report.omitted.push(OmittedIdentity {
                        name: identity.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Names come from distinct directory entries and embeddings from one
        // provider, so assembly only fails on a misbehaving provider.
        let db = match IdentityDatabase::from_records(records) {
            Ok(db) => db,
            Err(e) => {
                tracing::error!(error = %e, "inconsistent identity records; database is empty");
                report.corpus_error = Some(e.to_string());
                report.enrolled.clear();
                IdentityDatabase::empty()
            }
        };

        if db.is_empty() {
            tracing::error!("identity database is empty; every face will be Unknown");
        } else {
            tracing::info!(identities = db.len(), "identity database built");
        }

        db
    }

    fn embed_sample(&mut self, path: &Path) -> Result<Embedding, String> {
        let image = image::open(path)
            .map_err(|e| format!("unreadable image: {e}"))?
            .to_rgb8();
        let face = self.extract_face(image)?;
        let raw = self.provider.embed(&face).map_err(|e| e.to_string())?;
        Embedding::from_raw(raw, self.provider.dimension()).map_err(|e| e.to_string())
    }

    fn extract_face(&mut self, image: RgbImage) -> Result<RgbImage, String> {
        let Some(detector) = self.detector.as_mut() else {
            return Ok(image);
        };
        let faces = detector.detect(&image).map_err(|e| e.to_string())?;
        let face = largest_face(&faces).ok_or_else(|| "no face detected".to_string())?;
        crop_face(&image, face).ok_or_else(|| "face box outside image".to_string())
    }
}
