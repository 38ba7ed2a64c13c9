//! Append-only record of rejected faces.
//!
//! Every rejection saves the face crop as `unknown_<ts>.jpg` and appends one
//! line to `unknown_log.txt`:
//!
//! ```text
//! 20250101_120000_123456, best_sim=0.6123, file=logs/unknown_faces/unknown_20250101_120000_123456.jpg
//! ```

use image::RgbImage;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LEDGER_FILE: &str = "unknown_log.txt";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save face image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// One rejected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub score: f32,
    pub image_path: PathBuf,
}

impl LedgerEntry {
    fn to_line(&self) -> String {
        format!(
            "{}, best_sim={:.4}, file={}",
            self.timestamp,
            self.score,
            self.image_path.display()
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, ", ");
        let timestamp = parts.next()?.trim();
        let score = parts.next()?.strip_prefix("best_sim=")?.parse().ok()?;
        let image_path = parts.next()?.strip_prefix("file=")?;
        if timestamp.is_empty() || image_path.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: timestamp.to_string(),
            score,
            image_path: PathBuf::from(image_path),
        })
    }
}

/// Unknown-face ledger rooted at one directory.
#[derive(Debug, Clone)]
pub struct UnknownFaceLedger {
    dir: PathBuf,
}

impl UnknownFaceLedger {
    /// The directory is created on first write, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    /// Save the face crop and append an entry for it. If the entry cannot be
    /// appended the saved crop is removed again.
    pub fn log_rejection(&self, face: &RgbImage, score: f32) -> Result<LedgerEntry, LedgerError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| LedgerError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let image_path = self.unused_image_path(&timestamp);
        face.save(&image_path).map_err(|source| LedgerError::Image {
            path: image_path.clone(),
            source,
        })?;

        let entry = LedgerEntry {
            timestamp,
            score,
            image_path,
        };

        // An image without a log line would never show up in `entries`.
        if let Err(e) = self.append_line(&entry) {
            if let Err(cleanup) = std::fs::remove_file(&entry.image_path) {
                tracing::warn!(
                    image = %entry.image_path.display(),
                    error = %cleanup,
                    "could not remove unlogged face image"
                );
            }
            return Err(e);
        }

        tracing::info!(
            score = entry.score,
            image = %entry.image_path.display(),
            "unknown face logged"
        );
        Ok(entry)
    }

    /// Read all entries back in write order. A missing log reads as empty.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let log_path = self.log_path();
        let text = match std::fs::read_to_string(&log_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: log_path,
                    source,
                })
            }
        };

        let mut entries = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match LedgerEntry::parse_line(line) {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(line = n + 1, "malformed ledger line skipped"),
            }
        }
        Ok(entries)
    }

    fn append_line(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let log_path = self.log_path();
        let io_err = |source| LedgerError::Io {
            path: log_path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(io_err)?;
        writeln!(file, "{}", entry.to_line()).map_err(io_err)
    }

    fn unused_image_path(&self, timestamp: &str) -> PathBuf {
        let mut path = self.dir.join(format!("unknown_{timestamp}.jpg"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("unknown_{timestamp}_{n}.jpg"));
            n += 1;
        }
        path
    }
}
