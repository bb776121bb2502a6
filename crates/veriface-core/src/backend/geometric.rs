//! Classical face-region detector.
//!
//! Skin pixels are segmented in YCbCr, grouped into 8-connected blobs, and a
//! blob qualifies as a face when its shape is plausible and it encloses at
//! least two non-skin "feature holes" (eyes, mouth). Largest qualifying
//! blob wins.

use super::{BackendError, Capabilities, Detection, FaceBackend};
use crate::types::{BackendTier, FaceRegion, Image};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::ops::RangeInclusive;

const SKIN_CB: RangeInclusive<f32> = 77.0..=127.0;
const SKIN_CR: RangeInclusive<f32> = 133.0..=173.0;
const MIN_FACE_SIDE: u32 = 24;
const MIN_FILL_RATIO: f32 = 0.4;
/// Height over width.
const ASPECT_RANGE: RangeInclusive<f32> = 0.75..=2.2;
const MIN_FEATURE_HOLES: usize = 2;
const MIN_HOLE_PIXELS: u32 = 4;

const BASE_CONFIDENCE: f32 = 40.0;
const SIZE_CONFIDENCE_SPAN: f32 = 30.0;
/// Face share of the image at which size confidence saturates.
const FULL_SIZE_FRACTION: f32 = 0.1;

const SKIN: Luma<u8> = Luma([255]);
const NOT_SKIN: Luma<u8> = Luma([0]);

/// `40 + 30 * min(1, face_area / (0.1 * image_area))`.
pub fn size_confidence(face_area: f32, image_area: f32) -> f32 {
    if image_area <= 0.0 {
        return BASE_CONFIDENCE;
    }
    let fraction = (face_area / (FULL_SIZE_FRACTION * image_area)).clamp(0.0, 1.0);
    BASE_CONFIDENCE + SIZE_CONFIDENCE_SPAN * fraction
}

#[derive(Debug, Clone, Copy)]
struct Blob {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixels: u32,
}

impl Blob {
    fn at(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            pixels: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.pixels += 1;
    }

    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    fn bbox_area(&self) -> u32 {
        self.width() * self.height()
    }
}

/// Every labelled component with its label, in label order.
fn collect_blobs(labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>) -> Vec<(u32, Blob)> {
    let mut blobs: Vec<Option<Blob>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if blobs.len() < label {
            blobs.resize(label, None);
        }
        blobs[label - 1].get_or_insert_with(|| Blob::at(x, y)).add(x, y);
    }
    blobs
        .into_iter()
        .enumerate()
        .filter_map(|(i, blob)| blob.map(|b| (i as u32 + 1, b)))
        .collect()
}

fn skin_mask(image: &Image) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0.map(f32::from);
        let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
        let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
        if SKIN_CB.contains(&cb) && SKIN_CR.contains(&cr) {
            SKIN
        } else {
            NOT_SKIN
        }
    })
}

/// Non-skin regions fully enclosed by the blob, within a plausible size
/// for eyes, nostrils or a mouth.
fn count_feature_holes(
    labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>,
    label: u32,
    blob: &Blob,
) -> usize {
    let (w, h) = (blob.width(), blob.height());
    let outside = GrayImage::from_fn(w, h, |x, y| {
        if labels.get_pixel(blob.min_x + x, blob.min_y + y)[0] == label {
            NOT_SKIN
        } else {
            SKIN
        }
    });

    let area = blob.bbox_area();
    let min_pixels = MIN_HOLE_PIXELS.max(area / 1000);
    let max_pixels = area / 4;

    collect_blobs(&connected_components(&outside, Connectivity::Four, NOT_SKIN))
        .iter()
        .map(|(_, hole)| hole)
        .filter(|hole| hole.min_x > 0 && hole.min_y > 0 && hole.max_x + 1 < w && hole.max_y + 1 < h)
        .filter(|hole| (min_pixels..=max_pixels).contains(&hole.pixels))
        .count()
}

/// Skin-segmentation detector; always available.
#[derive(Debug, Default)]
pub struct GeometricBackend;

impl GeometricBackend {
    pub fn new() -> Self {
        Self
    }

    /// Largest qualifying face region, if any.
    pub fn detect(&self, image: &Image) -> Option<FaceRegion> {
        let mask = skin_mask(image);
        let labels = connected_components(&mask, Connectivity::Eight, NOT_SKIN);

        let mut best: Option<Blob> = None;
        for (label, blob) in collect_blobs(&labels) {
            if blob.width() < MIN_FACE_SIDE || blob.height() < MIN_FACE_SIDE {
                continue;
            }
            let fill = blob.pixels as f32 / blob.bbox_area() as f32;
            let aspect = blob.height() as f32 / blob.width() as f32;
            if fill < MIN_FILL_RATIO || !ASPECT_RANGE.contains(&aspect) {
                continue;
            }
            if best.is_some_and(|b| b.bbox_area() >= blob.bbox_area()) {
                continue;
            }
            let holes = count_feature_holes(&labels, label, &blob);
            if holes < MIN_FEATURE_HOLES {
                tracing::trace!(
                    holes,
                    width = blob.width(),
                    height = blob.height(),
                    "skin blob rejected"
                );
                continue;
            }
            best = Some(blob);
        }

        let blob = best?;
        let image_area = image.width() as f32 * image.height() as f32;
        let confidence = size_confidence(blob.bbox_area() as f32, image_area);
        Some(FaceRegion::new(
            blob.min_x as f32,
            blob.min_y as f32,
            blob.width() as f32,
            blob.height() as f32,
            confidence,
        ))
    }
}

impl FaceBackend for GeometricBackend {
    fn name(&self) -> &str {
        "geometric"
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Geometric
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            extract_embedding: false,
            estimate_attributes: false,
            detect_region: true,
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run(&mut self, image: &Image) -> Result<Detection, BackendError> {
        self.detect(image)
            .map(Detection::region_only)
            .ok_or(BackendError::NoFaceDetected)
    }
}
