//! Enrollment staging for one identity.
//!
//! Face crops are accumulated in capture order and persisted as a fixed
//! 80/20 train/validation split:
//!
//! ```text
//! <dataset>/train/<name>/<name>_train_000.jpg ...
//! <dataset>/val/<name>/<name>_val_000.jpg ...
//! ```
//!
//! The split follows capture order (no shuffling), so the validation set holds
//! the poses captured last. The `train` directory is the corpus consumed by
//! the database builder.

use crate::detector::{crop_face, largest_face};
use crate::types::{validate_identity_name, BoundingBox};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TRAIN_DIR: &str = "train";
pub const VAL_DIR: &str = "val";
pub const DEFAULT_TARGET_SAMPLES: usize = 80;
pub const DEFAULT_CAPTURE_EVERY_N_FRAMES: u64 = 3;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("invalid identity name: {0}")]
    InvalidName(String),
    #[error("no samples captured for {0}; nothing persisted")]
    NoSamples(String),
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write sample {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Decides which live frames become samples: every N-th frame that has a face.
#[derive(Debug, Clone)]
pub struct CaptureSchedule {
    every_n_frames: u64,
    frames_seen: u64,
}

impl CaptureSchedule {
    pub fn new(every_n_frames: u64) -> Self {
        Self {
            every_n_frames: every_n_frames.max(1),
            frames_seen: 0,
        }
    }

    /// Count one frame; true if it should be sampled.
    pub fn tick(&mut self, has_face: bool) -> bool {
        self.frames_seen += 1;
        has_face && self.frames_seen % self.every_n_frames == 0
    }
}

impl Default for CaptureSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_EVERY_N_FRAMES)
    }
}

/// Outcome of offering a live frame to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    Skipped,
    Captured { count: usize },
    TargetReached { count: usize },
}

/// Where and how many samples were written.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentSummary {
    pub name: String,
    pub train_dir: PathBuf,
    pub val_dir: PathBuf,
    pub train: usize,
    pub val: usize,
}

/// Sample accumulator for one identity.
pub struct EnrollmentPipeline {
    name: String,
    target_samples: usize,
    samples: Vec<RgbImage>,
    schedule: CaptureSchedule,
}

impl EnrollmentPipeline {
    pub fn new(name: &str, target_samples: usize) -> Result<Self, EnrollmentError> {
        let name = name.trim();
        validate_identity_name(name).map_err(EnrollmentError::InvalidName)?;
        Ok(Self {
            name: name.to_string(),
            target_samples: target_samples.max(1),
            samples: Vec::new(),
            schedule: CaptureSchedule::default(),
        })
    }

    pub fn with_schedule(mut self, schedule: CaptureSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn target_reached(&self) -> bool {
        self.samples.len() >= self.target_samples
    }

    /// Append a face crop. Returns true once the target count is reached.
    pub fn push(&mut self, sample: RgbImage) -> bool {
        self.samples.push(sample);
        tracing::debug!(name = %self.name, count = self.samples.len(), "sample captured");
        self.target_reached()
    }

    /// Offer a live frame with its detections; the largest face is sampled
    /// when the capture schedule fires.
    pub fn offer_frame(&mut self, frame: &RgbImage, faces: &[BoundingBox]) -> CaptureEvent {
        if self.target_reached() || !self.schedule.tick(!faces.is_empty()) {
            return CaptureEvent::Skipped;
        }
        let Some(crop) = largest_face(faces).and_then(|face| crop_face(frame, face)) else {
            return CaptureEvent::Skipped;
        };

        let count = self.samples.len() + 1;
        if self.push(crop) {
            tracing::info!(name = %self.name, count, "reached target sample count");
            CaptureEvent::TargetReached { count }
        } else {
            CaptureEvent::Captured { count }
        }
    }

    /// First 80% of samples (rounded down) for training, the rest for validation.
    pub fn split(&self) -> (&[RgbImage], &[RgbImage]) {
        let n_train = self.samples.len() * 4 / 5;
        self.samples.split_at(n_train)
    }

    /// Write the split under `dataset_root`. Nothing is written without samples.
    pub fn persist(&self, dataset_root: &Path) -> Result<EnrollmentSummary, EnrollmentError> {
        if self.samples.is_empty() {
            tracing::warn!(name = %self.name, "no faces to save");
            return Err(EnrollmentError::NoSamples(self.name.clone()));
        }

        let train_dir = dataset_root.join(TRAIN_DIR).join(&self.name);
        let val_dir = dataset_root.join(VAL_DIR).join(&self.name);
        for dir in [&train_dir, &val_dir] {
            std::fs::create_dir_all(dir).map_err(|source| EnrollmentError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let (train, val) = self.split();
        write_samples(&train_dir, &self.name, TRAIN_DIR, train)?;
        write_samples(&val_dir, &self.name, VAL_DIR, val)?;

        tracing::info!(
            name = %self.name,
            train = train.len(),
            val = val.len(),
            train_dir = %train_dir.display(),
            "enrollment saved"
        );

        Ok(EnrollmentSummary {
            name: self.name.clone(),
            train_dir,
            val_dir,
            train: train.len(),
            val: val.len(),
        })
    }
}

fn write_samples(
    dir: &Path,
    name: &str,
    split: &str,
    samples: &[RgbImage],
) -> Result<(), EnrollmentError> {
    for (i, sample) in samples.iter().enumerate() {
        let path = dir.join(format!("{name}_{split}_{i:03}.jpg"));
        sample
            .save(&path)
            .map_err(|source| EnrollmentError::Image { path, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn tagged(i: usize) -> RgbImage {
        RgbImage::from_pixel(2, 2, Rgb([i as u8, 0, 0]))
    }

    fn tag(img: &RgbImage) -> u8 {
        img.get_pixel(0, 0)[0]
    }

    #[test]
    fn test_split_100_samples_80_20_in_order() {
        let mut p = EnrollmentPipeline::new("alen", 100).unwrap();
        for i in 0..100 {
            p.push(tagged(i));
        }
        let (train, val) = p.split();
        assert_eq!(train.len(), 80);
        assert_eq!(val.len(), 20);
        assert!(train.iter().enumerate().all(|(i, s)| tag(s) == i as u8));
        assert!(val.iter().enumerate().all(|(i, s)| tag(s) == (80 + i) as u8));
    }

    #[test]
    fn test_split_rounds_train_down() {
        let mut p = EnrollmentPipeline::new("alen", 10).unwrap();
        for i in 0..7 {
            p.push(tagged(i));
        }
        let (train, val) = p.split();
        assert_eq!((train.len(), val.len()), (5, 2));

        let mut single = EnrollmentPipeline::new("bea", 10).unwrap();
        single.push(tagged(0));
        let (train, val) = single.split();
        assert_eq!((train.len(), val.len()), (0, 1));
    }

    #[test]
    fn test_persist_writes_named_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = EnrollmentPipeline::new("alen", 5).unwrap();
        for i in 0..5 {
            p.push(tagged(i * 40));
        }
        let summary = p.persist(tmp.path()).unwrap();

        assert_eq!((summary.train, summary.val), (4, 1));
        assert!(tmp.path().join("train/alen/alen_train_000.jpg").exists());
        assert!(tmp.path().join("train/alen/alen_train_003.jpg").exists());
        assert!(tmp.path().join("val/alen/alen_val_000.jpg").exists());
        assert!(!tmp.path().join("val/alen/alen_val_001.jpg").exists());
    }

    #[test]
    fn test_persist_without_samples_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let p = EnrollmentPipeline::new("alen", 5).unwrap();
        assert!(matches!(p.persist(tmp.path()), Err(EnrollmentError::NoSamples(_))));
        assert!(!tmp.path().join(TRAIN_DIR).exists());
        assert!(!tmp.path().join(VAL_DIR).exists());
    }

    #[test]
    fn test_new_rejects_bad_names() {
        assert!(matches!(
            EnrollmentPipeline::new("   ", 5),
            Err(EnrollmentError::InvalidName(_))
        ));
        assert!(EnrollmentPipeline::new("Unknown", 5).is_err());
        assert!(EnrollmentPipeline::new("a/b", 5).is_err());
        assert_eq!(EnrollmentPipeline::new(" alen ", 5).unwrap().name(), "alen");
    }

    #[test]
    fn test_capture_schedule_every_third_face_frame() {
        let mut s = CaptureSchedule::new(3);
        let fired: Vec<bool> = [true, true, true, true, false, true, true]
            .iter()
            .map(|&has_face| s.tick(has_face))
            .collect();
        // Frame 6 has a face and is a multiple of 3; frame 3 too.
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_offer_frame_crops_largest_face_until_target() {
        let mut frame = RgbImage::from_pixel(40, 40, Rgb([10, 10, 10]));
        for y in 20..40 {
            for x in 20..40 {
                frame.put_pixel(x, y, Rgb([250, 0, 0]));
            }
        }
        let faces = [
            BoundingBox { x: 0, y: 0, width: 5, height: 5, confidence: 0.99 },
            BoundingBox { x: 20, y: 20, width: 20, height: 20, confidence: 0.6 },
        ];

        let mut p = EnrollmentPipeline::new("alen", 2)
            .unwrap()
            .with_schedule(CaptureSchedule::new(1));

        assert_eq!(p.offer_frame(&frame, &[]), CaptureEvent::Skipped);
        assert_eq!(p.offer_frame(&frame, &faces), CaptureEvent::Captured { count: 1 });
        assert_eq!(p.offer_frame(&frame, &faces), CaptureEvent::TargetReached { count: 2 });
        assert_eq!(p.offer_frame(&frame, &faces), CaptureEvent::Skipped);

        let (train, val) = p.split();
        let sample = &train.iter().chain(val.iter()).next().unwrap();
        assert_eq!(sample.dimensions(), (20, 20));
        assert_eq!(sample.get_pixel(0, 0)[0], 250);
    }
}
