use super::{lock_detector, BackendError, Capabilities, Detection, FaceBackend, SharedDetector};
use crate::attributes::{EmotionClassifier, GenderAgeEstimator};
use crate::types::{BackendTier, FaceAttributes, FaceRegion, Image};

/// Attributes of the strongest face plus its detection region.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnalysis {
    pub region: FaceRegion,
    pub attributes: FaceAttributes,
}

impl FaceAnalysis {
    pub fn detection_confidence(&self) -> f32 {
        self.region.confidence
    }
}

/// SCRFD detection with gender/age and optional emotion models.
pub struct AttributeBackend {
    detector: Option<SharedDetector>,
    genderage: Option<GenderAgeEstimator>,
    emotion: Option<EmotionClassifier>,
}

impl AttributeBackend {
    pub fn new(
        detector: Option<SharedDetector>,
        genderage: Option<GenderAgeEstimator>,
        emotion: Option<EmotionClassifier>,
    ) -> Self {
        Self {
            detector,
            genderage,
            emotion,
        }
    }

    pub fn analyze(&mut self, image: &Image) -> Result<FaceAnalysis, BackendError> {
        let (Some(detector), Some(genderage)) = (&self.detector, &mut self.genderage) else {
            return Err(BackendError::ModelUnavailable(
                "attribute backend needs both detector and gender/age model".into(),
            ));
        };

        let faces = lock_detector(detector).detect(image)?;
        let region = faces.into_iter().next().ok_or(BackendError::NoFaceDetected)?;
        let (age, gender) = genderage.estimate(image, &region)?;

        // Emotion is optional; a failing classifier only drops the label.
        let dominant_emotion = match self.emotion.as_mut() {
            Some(classifier) => match classifier.classify(image, &region) {
                Ok(label) => Some(label),
                Err(e) => {
                    tracing::warn!(error = %e, "emotion classification failed");
                    None
                }
            },
            None => None,
        };

        Ok(FaceAnalysis {
            region,
            attributes: FaceAttributes {
                age: Some(age),
                gender: Some(gender),
                dominant_emotion,
                dominant_race: None,
            },
        })
    }
}

impl FaceBackend for AttributeBackend {
    fn name(&self) -> &str {
        "genderage"
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Attribute
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            extract_embedding: false,
            estimate_attributes: true,
            detect_region: true,
        }
    }

    fn is_available(&self) -> bool {
        self.detector.is_some() && self.genderage.is_some()
    }

    fn run(&mut self, image: &Image) -> Result<Detection, BackendError> {
        let analysis = self.analyze(image)?;
        Ok(Detection {
            region: analysis.region,
            descriptor: None,
            attributes: Some(analysis.attributes),
        })
    }
}
