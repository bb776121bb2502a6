//! Coarse liveness heuristics.
//!
//! These only scale detection confidence down; they never reject a face.

use crate::types::{FaceRegion, Image};

/// Face ROI grayscale variance below this looks flat or printed.
pub const MIN_ROI_VARIANCE: f32 = 200.0;
pub const LOW_VARIANCE_FACTOR: f32 = 0.65;
/// Centre offset as a fraction of the image half-diagonal.
pub const MAX_CENTER_OFFSET: f32 = 0.5;
pub const OFF_CENTER_FACTOR: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessAssessment {
    pub roi_variance: f32,
    pub center_offset: f32,
}

impl LivenessAssessment {
    pub fn assess(image: &Image, region: &FaceRegion) -> Self {
        Self {
            roi_variance: roi_variance(image, region),
            center_offset: center_offset(image, region),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.roi_variance < MIN_ROI_VARIANCE
    }

    pub fn is_off_center(&self) -> bool {
        self.center_offset > MAX_CENTER_OFFSET
    }

    /// Combined confidence multiplier in (0, 1].
    pub fn factor(&self) -> f32 {
        let mut factor = 1.0;
        if self.is_flat() {
            factor *= LOW_VARIANCE_FACTOR;
        }
        if self.is_off_center() {
            factor *= OFF_CENTER_FACTOR;
        }
        factor
    }

    pub fn apply(&self, confidence: f32) -> f32 {
        (confidence * self.factor()).clamp(0.0, 100.0)
    }
}

/// Grayscale variance inside the face region; 0 when the region is empty.
pub fn roi_variance(image: &Image, region: &FaceRegion) -> f32 {
    let Some((x, y, w, h)) = region.pixel_rect(image.width(), image.height()) else {
        return 0.0;
    };
    let roi = image::imageops::crop_imm(image, x, y, w, h).to_image();
    let gray = image::imageops::grayscale(&roi);

    let n = (w as f64) * (h as f64);
    let (sum, sum_sq) = gray.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    ((sum_sq / n) - mean * mean).max(0.0) as f32
}

/// Distance from the face centre to the image centre over the half-diagonal.
pub fn center_offset(image: &Image, region: &FaceRegion) -> f32 {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let half_diagonal = (w * w + h * h).sqrt() / 2.0;
    if half_diagonal <= 0.0 {
        return 0.0;
    }
    let (cx, cy) = region.center();
    let (dx, dy) = (cx - w / 2.0, cy - h / 2.0);
    (dx * dx + dy * dy).sqrt() / half_diagonal
}
