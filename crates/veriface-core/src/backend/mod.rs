//! Face backends, ordered by preference.
//!
//! Each backend turns an image into a [`Detection`]. The [`BackendSet`]
//! resolves which ones are usable once at startup; the engine walks the
//! selected tiers and demotes on [`BackendError::ModelUnavailable`].

mod attribute;
mod embedding;
mod geometric;

pub use attribute::{AttributeBackend, FaceAnalysis};
pub use embedding::{EmbeddingBackend, EMBEDDING_DETECTION_CONFIDENCE};
pub use geometric::{size_confidence, GeometricBackend};

use crate::attributes::{AttributeError, EmotionClassifier, GenderAgeEstimator};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BackendTier, Descriptor, FaceAttributes, FaceRegion, Image};
use serde::Serialize;
use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";
pub const GENDERAGE_MODEL: &str = "genderage.onnx";
pub const EMOTION_MODEL: &str = "emotion-ferplus-8.onnx";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<DetectorError> for BackendError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => Self::ModelUnavailable(path),
            other => Self::Inference(other.to_string()),
        }
    }
}

impl From<RecognizerError> for BackendError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => Self::ModelUnavailable(path),
            other => Self::Inference(other.to_string()),
        }
    }
}

impl From<AttributeError> for BackendError {
    fn from(e: AttributeError) -> Self {
        match e {
            AttributeError::ModelNotFound(path) => Self::ModelUnavailable(path),
            other => Self::Inference(other.to_string()),
        }
    }
}

/// What a backend can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub extract_embedding: bool,
    pub estimate_attributes: bool,
    pub detect_region: bool,
}

/// One backend's view of the face in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub region: FaceRegion,
    pub descriptor: Option<Descriptor>,
    pub attributes: Option<FaceAttributes>,
}

impl Detection {
    pub fn region_only(region: FaceRegion) -> Self {
        Self {
            region,
            descriptor: None,
            attributes: None,
        }
    }
}

/// A face detection/recognition capability.
pub trait FaceBackend: Send {
    fn name(&self) -> &str;
    fn tier(&self) -> BackendTier;
    fn capabilities(&self) -> Capabilities;
    fn is_available(&self) -> bool;
    fn run(&mut self, image: &Image) -> Result<Detection, BackendError>;
}

/// SCRFD detector shared by the embedding and attribute backends.
pub type SharedDetector = Arc<Mutex<FaceDetector>>;

pub(crate) fn lock_detector(detector: &SharedDetector) -> MutexGuard<'_, FaceDetector> {
    detector.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which tiers a request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectionPolicy {
    pub has_identity: bool,
    pub basic_only: bool,
}

impl SelectionPolicy {
    pub fn tiers(&self) -> &'static [BackendTier] {
        use BackendTier::*;
        if self.basic_only {
            &[Geometric]
        } else if self.has_identity {
            &[Embedding, Attribute, Geometric]
        } else {
            &[Attribute, Geometric]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub tier: BackendTier,
    pub available: bool,
    pub capabilities: Capabilities,
}

/// Backends sorted by tier; always ends with a geometric backend.
pub struct BackendSet {
    backends: Vec<Box<dyn FaceBackend>>,
}

impl BackendSet {
    pub fn new(mut backends: Vec<Box<dyn FaceBackend>>) -> Self {
        backends.sort_by_key(|b| b.tier());
        if !backends.iter().any(|b| b.tier() == BackendTier::Geometric) {
            backends.push(Box::new(GeometricBackend::new()));
        }
        Self { backends }
    }

    /// Load every model found in `model_dir`. Missing or broken models leave
    /// their backend unavailable.
    pub fn from_model_dir(model_dir: &Path) -> Self {
        let detector = loaded("SCRFD detector", FaceDetector::load(&model_dir.join(DETECTOR_MODEL)))
            .map(|d| Arc::new(Mutex::new(d)));
        let recognizer = loaded(
            "ArcFace recognizer",
            FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL)),
        );
        let genderage = loaded(
            "gender/age model",
            GenderAgeEstimator::load(&model_dir.join(GENDERAGE_MODEL)),
        );
        let emotion = loaded(
            "emotion model",
            EmotionClassifier::load(&model_dir.join(EMOTION_MODEL)),
        );

        let set = Self::new(vec![
            Box::new(EmbeddingBackend::new(detector.clone(), recognizer)),
            Box::new(AttributeBackend::new(detector, genderage, emotion)),
            Box::new(GeometricBackend::new()),
        ]);

        for status in set.statuses() {
            tracing::info!(
                backend = %status.name,
                tier = ?status.tier,
                available = status.available,
                model_dir = %model_dir.display(),
                "backend resolved"
            );
        }
        set
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Indices of the backends to try, in order: the first available
    /// backend of each tier the policy allows.
    pub fn plan(&self, policy: SelectionPolicy) -> Vec<usize> {
        policy.tiers().iter().filter_map(|&tier| self.find_tier(tier)).collect()
    }

    /// First available backend of `tier`.
    pub fn find_tier(&self, tier: BackendTier) -> Option<usize> {
        self.backends
            .iter()
            .position(|b| b.tier() == tier && b.is_available())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn FaceBackend + 'static)> {
        self.backends.get_mut(index).map(|b| b.as_mut())
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                name: b.name().to_string(),
                tier: b.tier(),
                available: b.is_available(),
                capabilities: b.capabilities(),
            })
            .collect()
    }
}

fn loaded<T, E: Display>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(model) => Some(model),
        Err(e) => {
            tracing::warn!(error = %e, "{what} unavailable");
            None
        }
    }
}
