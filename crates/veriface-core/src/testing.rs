//! Test fixtures: synthetic faces, stub backends and an in-memory store.

use crate::backend::{
    BackendError, Capabilities, Detection, FaceBackend, EMBEDDING_DETECTION_CONFIDENCE,
};
use crate::store::{
    validate_identity, DescriptorRecord, DescriptorStore, Payload, PayloadKind, StoreError,
};
use crate::types::{BackendTier, Descriptor, FaceAttributes, FaceRegion, Image};
use chrono::Utc;
use image::imageops::FilterType;
use image::{ImageFormat, Rgb};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_ellipse_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const SKIN_TONE: [u8; 3] = [233, 191, 155];
const BACKGROUND: [u8; 3] = [40, 60, 120];
const FEATURE: [u8; 3] = [30, 30, 30];

/// Skin ellipse with two dark eyes and a mouth on a blue background.
pub fn synthetic_face(width: u32, height: u32, cx: i32, cy: i32, rx: i32, ry: i32) -> Image {
    let mut image = Image::from_pixel(width, height, Rgb(BACKGROUND));
    draw_filled_ellipse_mut(&mut image, (cx, cy), rx, ry, Rgb(SKIN_TONE));

    let eye_dx = rx * 2 / 5;
    let eye_y = cy - ry / 4;
    for eye_x in [cx - eye_dx, cx + eye_dx] {
        draw_filled_circle_mut(&mut image, (eye_x, eye_y), (rx / 8).max(2), Rgb(FEATURE));
    }

    let mouth_w = (rx * 3 / 5).max(4) as u32;
    let mouth_h = (ry * 2 / 25).max(2) as u32;
    let mouth_y = cy + ry * 9 / 20;
    draw_filled_rect_mut(
        &mut image,
        Rect::at(cx - mouth_w as i32 / 2, mouth_y).of_size(mouth_w, mouth_h),
        Rgb(FEATURE),
    );
    image
}

pub fn png_bytes(image: &Image) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("png encode");
    buf
}

fn is_uniform(image: &Image) -> bool {
    let mut pixels = image.pixels();
    match pixels.next() {
        Some(first) => pixels.all(|p| p == first),
        None => true,
    }
}

/// 8×8 mean-centred grayscale thumbnail.
fn thumbnail_descriptor(image: &Image) -> Descriptor {
    let gray = image::imageops::grayscale(image);
    let small = image::imageops::resize(&gray, 8, 8, FilterType::Triangle);
    let values: Vec<f32> = small.pixels().map(|p| p[0] as f32).collect();
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    Descriptor::new(values.into_iter().map(|v| v - mean).collect(), "stub-64")
}

/// Deterministic backend: uniform images have no face, anything else is a
/// face covering the whole image.
pub struct StubBackend {
    tier: BackendTier,
    confidence: f32,
    available: bool,
    failing: bool,
    miss_first: bool,
    calls: usize,
}

impl StubBackend {
    fn new(tier: BackendTier, confidence: f32) -> Self {
        Self {
            tier,
            confidence,
            available: true,
            failing: false,
            miss_first: false,
            calls: 0,
        }
    }

    pub fn embedding() -> Self {
        Self::new(BackendTier::Embedding, EMBEDDING_DETECTION_CONFIDENCE)
    }

    pub fn attribute(confidence: f32) -> Self {
        Self::new(BackendTier::Attribute, confidence)
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Every run fails with an inference error.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn no_face_on_first_call(mut self) -> Self {
        self.miss_first = true;
        self
    }
}

impl FaceBackend for StubBackend {
    fn name(&self) -> &str {
        match self.tier {
            BackendTier::Embedding => "stub-embedding",
            BackendTier::Attribute => "stub-attribute",
            BackendTier::Geometric => "stub-geometric",
        }
    }

    fn tier(&self) -> BackendTier {
        self.tier
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            extract_embedding: self.tier == BackendTier::Embedding,
            estimate_attributes: self.tier == BackendTier::Attribute,
            detect_region: true,
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn run(&mut self, image: &Image) -> Result<Detection, BackendError> {
        self.calls += 1;
        if !self.available {
            return Err(BackendError::ModelUnavailable("stub".into()));
        }
        if self.failing {
            return Err(BackendError::Inference("stub failure".into()));
        }
        if (self.miss_first && self.calls == 1) || is_uniform(image) {
            return Err(BackendError::NoFaceDetected);
        }

        let region = FaceRegion::full(image, self.confidence);
        Ok(match self.tier {
            BackendTier::Embedding => Detection {
                region,
                descriptor: Some(thumbnail_descriptor(image)),
                attributes: None,
            },
            BackendTier::Attribute => Detection {
                region,
                descriptor: None,
                attributes: Some(FaceAttributes {
                    age: Some(30),
                    gender: Some("Woman".into()),
                    dominant_emotion: Some("neutral".into()),
                    dominant_race: None,
                }),
            },
            BackendTier::Geometric => Detection::region_only(region),
        })
    }
}

/// In-memory store with injectable write failures.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<(DescriptorRecord, Payload)>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl DescriptorStore for MemoryStore {
    fn enroll(
        &self,
        identity: &str,
        payload: &Payload,
        source_model: &str,
    ) -> Result<DescriptorRecord, StoreError> {
        validate_identity(identity)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: identity.into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            });
        }
        let record_id = Uuid::new_v4();
        let ext = match payload.kind() {
            PayloadKind::Descriptor => "f32",
            PayloadKind::Image => "jpg",
        };
        let record = DescriptorRecord {
            record_id,
            identity: identity.to_string(),
            created_at: Utc::now(),
            filename: format!("{record_id}.{ext}"),
            kind: payload.kind(),
            source_model: source_model.to_string(),
            dimensions: payload.dimensions(),
        };
        self.records.lock().unwrap().push((record.clone(), payload.clone()));
        Ok(record)
    }

    fn list(&self, identity: &str) -> Result<Vec<DescriptorRecord>, StoreError> {
        validate_identity(identity)?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r.identity == identity)
            .map(|(r, _)| r.clone())
            .collect())
    }

    fn list_all(&self) -> Result<Vec<DescriptorRecord>, StoreError> {
        Ok(self.records.lock().unwrap().iter().map(|(r, _)| r.clone()).collect())
    }

    fn load(&self, record: &DescriptorRecord) -> Result<Payload, StoreError> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| r.record_id == record.record_id)
            .map(|(_, p)| p.clone())
            .ok_or(StoreError::NotFound(record.record_id))
    }

    fn delete(&self, identity: &str, record_id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|(r, _)| !(r.identity == identity && r.record_id == record_id));
        Ok(records.len() < before)
    }

    fn delete_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|(r, _)| r.identity != identity);
        Ok(before - records.len())
    }
}
