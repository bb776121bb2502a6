use super::{lock_detector, BackendError, Capabilities, Detection, FaceBackend, SharedDetector};
use crate::recognizer::FaceRecognizer;
use crate::types::{BackendTier, Descriptor, FaceRegion, Image};

/// Detection confidence reported by the embedding tier.
pub const EMBEDDING_DETECTION_CONFIDENCE: f32 = 85.0;

/// SCRFD detection followed by ArcFace descriptor extraction.
pub struct EmbeddingBackend {
    detector: Option<SharedDetector>,
    recognizer: Option<FaceRecognizer>,
}

impl EmbeddingBackend {
    pub fn new(detector: Option<SharedDetector>, recognizer: Option<FaceRecognizer>) -> Self {
        Self { detector, recognizer }
    }

    /// Descriptor of the strongest face, with the region it was taken from.
    pub fn extract(&mut self, image: &Image) -> Result<(FaceRegion, Descriptor), BackendError> {
        let (Some(detector), Some(recognizer)) = (&self.detector, &mut self.recognizer) else {
            return Err(BackendError::ModelUnavailable(
                "embedding backend needs both detector and recognizer".into(),
            ));
        };

        let faces = lock_detector(detector).detect(image)?;
        let face = faces.into_iter().next().ok_or(BackendError::NoFaceDetected)?;
        let descriptor = recognizer.extract(image, &face)?;

        tracing::debug!(
            score = face.confidence,
            dim = descriptor.dim(),
            model = %descriptor.model,
            "descriptor extracted"
        );
        Ok((face, descriptor))
    }
}

impl FaceBackend for EmbeddingBackend {
    fn name(&self) -> &str {
        "arcface"
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Embedding
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            extract_embedding: true,
            estimate_attributes: false,
            detect_region: true,
        }
    }

    fn is_available(&self) -> bool {
        self.detector.is_some() && self.recognizer.is_some()
    }

    fn run(&mut self, image: &Image) -> Result<Detection, BackendError> {
        let (mut region, descriptor) = self.extract(image)?;
        region.confidence = EMBEDDING_DETECTION_CONFIDENCE;
        Ok(Detection {
            region,
            descriptor: Some(descriptor),
            attributes: None,
        })
    }
}
