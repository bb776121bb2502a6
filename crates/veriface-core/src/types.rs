use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decoded RGB pixel grid (height × width × 3).
pub type Image = image::RgbImage;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detection confidence on the 0–100 scale.
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    /// Region covering a whole image.
    pub fn full(image: &Image, confidence: f32) -> Self {
        Self::new(0.0, 0.0, image.width() as f32, image.height() as f32, confidence)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow the box on every side by `fraction` of its shorter side.
    pub fn expanded(&self, fraction: f32) -> Self {
        let margin = self.width.min(self.height) * fraction;
        Self {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + 2.0 * margin,
            height: self.height + 2.0 * margin,
            ..self.clone()
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `width × height` image.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn pixel_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.floor().max(0.0) as u32;
        let y0 = self.y.floor().max(0.0) as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Crop a face from an image, widened by `margin` of the shorter side.
///
/// Falls back to the whole image when the region lies outside it.
pub fn crop_face(image: &Image, region: &FaceRegion, margin: f32) -> Image {
    match region.expanded(margin).pixel_rect(image.width(), image.height()) {
        Some((x, y, w, h)) => image::imageops::crop_imm(image, x, y, w, h).to_image(),
        None => image.clone(),
    }
}

/// Face descriptor: a fixed-length vector tied to the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model that produced this descriptor (e.g., "w600k_r50").
    pub model: String,
}

impl Descriptor {
    pub fn new(values: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            values,
            model: model.into(),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero-norm vectors score 0.
    ///
    /// Always processes all dimensions.
    pub fn cosine_similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Cosine similarity mapped to [0, 1] via `(cos + 1) / 2`.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        ((self.cosine_similarity(other) + 1.0) / 2.0).clamp(0.0, 1.0)
    }

    /// Cosine distance `1 - cos`, in [0, 2].
    pub fn cosine_distance(&self, other: &Descriptor) -> f32 {
        1.0 - self.cosine_similarity(other)
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|v| *v /= norm);
        }
        self
    }

    /// Little-endian f32 encoding used for descriptor payload files.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8], model: impl Into<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values, model))
    }
}

/// Coarse demographic and expression attributes of a face.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub dominant_emotion: Option<String>,
    pub dominant_race: Option<String>,
}

/// Backend tiers in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    Embedding,
    Attribute,
    Geometric,
}

/// Why a verification did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Decode,
    NoFaceDetected,
    ModelUnavailable,
    DimensionMismatch,
    BackendTimeout,
    StoreIo,
}

/// Outcome of one verification call. Confidence is on the 0–100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub confidence: f32,
    pub matched: bool,
    /// Matched record, or the record created by enrollment.
    #[serde(rename = "face_id")]
    pub record_id: Option<Uuid>,
    pub message: String,
    pub results: Option<FaceAttributes>,
    pub request_id: Option<String>,
    /// Tier that produced the detection.
    pub backend: Option<BackendTier>,
    pub error: Option<FailureKind>,
}

impl VerificationResult {
    pub fn failure(
        kind: FailureKind,
        message: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            success: false,
            confidence: 0.0,
            matched: false,
            record_id: None,
            message: message.into(),
            results: None,
            request_id,
            backend: None,
            error: Some(kind),
        }
    }
}
