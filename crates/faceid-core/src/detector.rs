//! Face detector contract and crop helpers.
//!
//! Detection itself is external; the core only consumes rectangles.

use crate::types::BoundingBox;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection failed: {0}")]
    DetectionFailed(String),
}

/// Returns zero or more face rectangles for a frame.
pub trait FaceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// The detection with the largest area, if any.
pub fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    // max_by_key keeps the last maximum; scan in reverse so ties go to the first box.
    faces.iter().rev().max_by_key(|b| b.area())
}

/// Crop a detected face out of a frame.
///
/// The box is clamped to the frame: negative origins move to 0 and sizes are
/// at least one pixel. Returns `None` when nothing of the box lies inside the
/// frame.
pub fn crop_face(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let x = face.x.max(0) as u32;
    let y = face.y.max(0) as u32;
    let w = face.width.max(1) as u32;
    let h = face.height.max(1) as u32;

    if x >= frame.width() || y >= frame.height() {
        return None;
    }
    let w = w.min(frame.width() - x);
    let h = h.min(frame.height() - y);

    Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: i32, y: i32, width: i32, height: i32) -> BoundingBox {
        BoundingBox { x, y, width, height, confidence: 0.9 }
    }

    #[test]
    fn test_largest_face() {
        let faces = vec![bbox(0, 0, 10, 10), bbox(5, 5, 40, 30), bbox(1, 1, 20, 20)];
        assert_eq!(largest_face(&faces), Some(&faces[1]));
        assert_eq!(largest_face(&[]), None);
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = vec![bbox(0, 0, 10, 20), bbox(30, 30, 20, 10), bbox(5, 5, 4, 4)];
        assert!(std::ptr::eq(largest_face(&faces).unwrap(), &faces[0]));
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let frame = RgbImage::from_pixel(50, 40, Rgb([1, 2, 3]));
        let crop = crop_face(&frame, &bbox(-5, 30, 20, 20)).unwrap();
        assert_eq!(crop.dimensions(), (20, 10));
    }

    #[test]
    fn test_crop_face_outside_frame() {
        let frame = RgbImage::new(50, 40);
        assert!(crop_face(&frame, &bbox(60, 0, 10, 10)).is_none());
    }

    #[test]
    fn test_crop_face_zero_size_becomes_one_pixel() {
        let frame = RgbImage::new(50, 40);
        let crop = crop_face(&frame, &bbox(3, 3, 0, 0)).unwrap();
        assert_eq!(crop.dimensions(), (1, 1));
    }
}
