//! Demographic and expression attribute models.
//!
//! - InsightFace `genderage`: 96×96 RGB crop, raw 0–255 input, output
//!   `[female, male, age / 100]`.
//! - FER+ `emotion-ferplus-8`: 64×64 grayscale crop, raw 0–255 input, eight
//!   emotion logits.

use crate::types::{FaceRegion, Image};
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const GENDERAGE_INPUT_SIZE: u32 = 96;
/// Crop side relative to the longer side of the detection box.
const GENDERAGE_CROP_SCALE: f32 = 1.5;
const FERPLUS_INPUT_SIZE: u32 = 64;

pub const EMOTION_LABELS: [&str; 8] = [
    "neutral",
    "happiness",
    "surprise",
    "sadness",
    "anger",
    "disgust",
    "fear",
    "contempt",
];

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

fn load_session(model_path: &Path, label: &str) -> Result<Session, AttributeError> {
    if !model_path.exists() {
        return Err(AttributeError::ModelNotFound(model_path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(1)?
        .commit_from_file(model_path)?;
    tracing::info!(path = %model_path.display(), model = label, "loaded attribute model");
    Ok(session)
}

/// Age and gender estimation.
pub struct GenderAgeEstimator {
    session: Session,
}

impl GenderAgeEstimator {
    pub fn load(model_path: &Path) -> Result<Self, AttributeError> {
        Ok(Self {
            session: load_session(model_path, "genderage")?,
        })
    }

    /// Returns `(age, gender)` for a detected face.
    pub fn estimate(
        &mut self,
        image: &Image,
        face: &FaceRegion,
    ) -> Result<(u32, String), AttributeError> {
        let crop = square_crop(image, face, GENDERAGE_CROP_SCALE, GENDERAGE_INPUT_SIZE);

        let size = GENDERAGE_INPUT_SIZE as usize;
        let mut input = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32;
            }
        }

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("genderage: {e}")))?;

        interpret_genderage(raw)
            .ok_or_else(|| {
                AttributeError::InferenceFailed(format!("genderage returned {} values", raw.len()))
            })
    }
}

/// Dominant-emotion classification.
pub struct EmotionClassifier {
    session: Session,
}

impl EmotionClassifier {
    pub fn load(model_path: &Path) -> Result<Self, AttributeError> {
        Ok(Self {
            session: load_session(model_path, "emotion-ferplus")?,
        })
    }

    pub fn classify(&mut self, image: &Image, face: &FaceRegion) -> Result<String, AttributeError> {
        let crop = square_crop(image, face, 1.0, FERPLUS_INPUT_SIZE);
        let gray = image::imageops::grayscale(&crop);

        let size = FERPLUS_INPUT_SIZE as usize;
        let mut input = Array4::<f32>::zeros((1, 1, size, size));
        for (x, y, pixel) in gray.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32;
        }

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("emotion: {e}")))?;

        argmax(logits)
            .and_then(|i| EMOTION_LABELS.get(i))
            .map(|label| label.to_string())
            .ok_or_else(|| {
                AttributeError::InferenceFailed(format!("emotion returned {} logits", logits.len()))
            })
    }
}

/// Square crop centred on the face, `scale` times its longer side, resized
/// to `out_size`. Parts outside the image are black.
fn square_crop(image: &Image, face: &FaceRegion, scale: f32, out_size: u32) -> Image {
    let (cx, cy) = face.center();
    let side = (face.width.max(face.height) * scale).max(1.0);
    let x0 = (cx - side / 2.0).round() as i64;
    let y0 = (cy - side / 2.0).round() as i64;
    let side_px = side.round().max(1.0) as u32;

    let mut square = Image::new(side_px, side_px);
    image::imageops::replace(&mut square, image, -x0, -y0);
    image::imageops::resize(&square, out_size, out_size, FilterType::Triangle)
}

/// Decode `[female, male, age / 100]`.
pub(crate) fn interpret_genderage(raw: &[f32]) -> Option<(u32, String)> {
    if raw.len() < 3 {
        return None;
    }
    let gender = if raw[1] > raw[0] { "Man" } else { "Woman" };
    let age = (raw[2] * 100.0).round().max(0.0) as u32;
    Some((age, gender.to_string()))
}

/// Index of the largest value; the first wins ties. `None` when empty.
pub(crate) fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}
