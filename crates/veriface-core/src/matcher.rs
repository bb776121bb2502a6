//! Best-match search over stored descriptors.
//!
//! Scores are in [0, 1]; [`BestMatch::confidence`] is the single conversion
//! to the 0–100 result scale.

use crate::types::{Descriptor, Image};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;
pub const DEFAULT_MAX_DISTANCE: f32 = 0.4;
pub const DEFAULT_HISTOGRAM_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor dimension mismatch: query has {expected}, candidate has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor model mismatch: query from {expected}, candidate from {actual}")]
    ModelMismatch { expected: String, actual: String },
}

/// Winning candidate and its score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch<I> {
    pub id: I,
    pub similarity: f32,
}

impl<I> BestMatch<I> {
    /// Score on the 0–100 scale.
    pub fn confidence(&self) -> f32 {
        self.similarity * 100.0
    }
}

/// Acceptance rule for descriptor matches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchMetric {
    /// `(cos + 1) / 2 >= threshold`.
    Cosine { threshold: f32 },
    /// `1 - cos <= max_distance`; score `1 - d`.
    Distance { max_distance: f32 },
}

impl Default for MatchMetric {
    fn default() -> Self {
        Self::Cosine {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl MatchMetric {
    pub fn find_best<'a, I, It>(
        &self,
        query: &Descriptor,
        candidates: It,
    ) -> Result<Option<BestMatch<I>>, MatchError>
    where
        I: Clone + 'a,
        It: IntoIterator<Item = (&'a I, &'a Descriptor)>,
    {
        match *self {
            Self::Cosine { threshold } => find_best_match(query, candidates, threshold),
            Self::Distance { max_distance } => {
                find_best_match_by_distance(query, candidates, max_distance)
            }
        }
    }
}

fn check_compatible<'a, I: 'a>(
    query: &Descriptor,
    candidates: &[(&'a I, &'a Descriptor)],
) -> Result<(), MatchError> {
    for (_, candidate) in candidates {
        if candidate.dim() != query.dim() {
            return Err(MatchError::DimensionMismatch {
                expected: query.dim(),
                actual: candidate.dim(),
            });
        }
        if candidate.model != query.model {
            return Err(MatchError::ModelMismatch {
                expected: query.model.clone(),
                actual: candidate.model.clone(),
            });
        }
    }
    Ok(())
}

/// Highest-scoring candidate with `score >= floor`; first seen wins ties.
fn best_by<'a, I, F>(
    query: &Descriptor,
    candidates: Vec<(&'a I, &'a Descriptor)>,
    floor: f32,
    score: F,
) -> Result<Option<BestMatch<I>>, MatchError>
where
    I: Clone + 'a,
    F: Fn(&Descriptor, &Descriptor) -> f32,
{
    check_compatible(query, &candidates)?;

    let mut best: Option<BestMatch<I>> = None;
    for (id, candidate) in candidates {
        let s = score(query, candidate);
        if s < floor {
            continue;
        }
        if best.as_ref().map_or(true, |b| s > b.similarity) {
            best = Some(BestMatch { id: id.clone(), similarity: s });
        }
    }
    Ok(best)
}

/// Best candidate by `(cos + 1) / 2`, accepted at `>= threshold`.
///
/// Every candidate is checked for dimension and model before any scoring;
/// one incompatible candidate aborts the whole match.
pub fn find_best_match<'a, I, It>(
    query: &Descriptor,
    candidates: It,
    threshold: f32,
) -> Result<Option<BestMatch<I>>, MatchError>
where
    I: Clone + 'a,
    It: IntoIterator<Item = (&'a I, &'a Descriptor)>,
{
    best_by(query, candidates.into_iter().collect(), threshold, Descriptor::similarity)
}

/// Best candidate by cosine distance, accepted at `d <= max_distance`.
/// The reported score is `1 - d`.
pub fn find_best_match_by_distance<'a, I, It>(
    query: &Descriptor,
    candidates: It,
    max_distance: f32,
) -> Result<Option<BestMatch<I>>, MatchError>
where
    I: Clone + 'a,
    It: IntoIterator<Item = (&'a I, &'a Descriptor)>,
{
    best_by(query, candidates.into_iter().collect(), 1.0 - max_distance, |q, c| {
        (1.0 - q.cosine_distance(c)).clamp(0.0, 1.0)
    })
}

const HISTOGRAM_BINS: usize = 32;

/// Luma histogram with 8 gray levels per bin, coarse enough to absorb JPEG
/// noise in stored crops.
fn gray_histogram(image: &Image) -> [f64; HISTOGRAM_BINS] {
    let mut bins = [0.0f64; HISTOGRAM_BINS];
    for pixel in image::imageops::grayscale(image).pixels() {
        bins[(pixel[0] >> 3) as usize] += 1.0;
    }
    bins
}

/// Pearson correlation of the grayscale histograms, in [-1, 1].
///
/// Two flat histograms correlate at 1 when identical and 0 otherwise.
pub fn histogram_correlation(a: &Image, b: &Image) -> f32 {
    let (ha, hb) = (gray_histogram(a), gray_histogram(b));
    let mean_a = ha.iter().sum::<f64>() / HISTOGRAM_BINS as f64;
    let mean_b = hb.iter().sum::<f64>() / HISTOGRAM_BINS as f64;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in ha.iter().zip(hb.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = (var_a * var_b).sqrt();
    if denom > 0.0 {
        (cov / denom).clamp(-1.0, 1.0) as f32
    } else if ha == hb {
        1.0
    } else {
        0.0
    }
}

/// Best stored image by histogram correlation, accepted at `> threshold`.
pub fn find_best_image_match<'a, I, It>(
    query: &Image,
    candidates: It,
    threshold: f32,
) -> Option<BestMatch<I>>
where
    I: Clone + 'a,
    It: IntoIterator<Item = (&'a I, &'a Image)>,
{
    let mut best: Option<BestMatch<I>> = None;
    for (id, candidate) in candidates {
        let score = histogram_correlation(query, candidate).max(0.0);
        if score <= threshold {
            continue;
        }
        if best.as_ref().map_or(true, |b| score > b.similarity) {
            best = Some(BestMatch {
                id: id.clone(),
                similarity: score,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec(), "m")
    }

    #[test]
    fn test_self_match() {
        let q = d(&[0.3, -0.2, 0.9]);
        let candidates = vec![("a".to_string(), q.clone())];
        let best = find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.8)
            .unwrap()
            .unwrap();
        assert_eq!(best.id, "a");
        assert!((best.similarity - 1.0).abs() < 1e-6);
        assert!((best.confidence() - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_candidates() {
        let q = d(&[1.0, 0.0]);
        let none: Vec<(u32, Descriptor)> = Vec::new();
        assert_eq!(find_best_match(&q, none.iter().map(|(i, c)| (i, c)), 0.8).unwrap(), None);
    }

    #[test]
    fn test_below_threshold() {
        let q = d(&[1.0, 0.0]);
        let candidates = [(1u32, d(&[0.0, 1.0]))];
        // orthogonal maps to 0.5
        assert_eq!(find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.8).unwrap(), None);
        let hit = find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.5).unwrap();
        assert_eq!(hit.map(|b| b.id), Some(1));
    }

    #[test]
    fn test_dimension_mismatch_aborts_before_scoring() {
        let q = d(&[1.0, 0.0, 0.0]);
        let candidates = [(1u32, q.clone()), (2u32, d(&[1.0, 0.0]))];
        let err = find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.8).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_model_mismatch_rejected() {
        let q = d(&[1.0, 0.0]);
        let other = Descriptor::new(vec![1.0, 0.0], "other");
        let candidates = [(1u32, other)];
        let err = find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.8).unwrap_err();
        assert!(matches!(err, MatchError::ModelMismatch { .. }));
    }

    #[test]
    fn test_ties_keep_first_seen() {
        let q = d(&[1.0, 0.0]);
        let candidates = [(1u32, d(&[2.0, 0.0])), (2u32, d(&[1.0, 0.0])), (3u32, d(&[1.0, 1.0]))];
        let best = find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.8)
            .unwrap()
            .unwrap();
        assert_eq!(best.id, 1);
    }

    #[test]
    fn test_best_of_several() {
        let q = d(&[1.0, 0.0]);
        let candidates = [(1u32, d(&[1.0, 0.5])), (2u32, d(&[1.0, 0.1])), (3u32, d(&[-1.0, 0.0]))];
        let best = find_best_match(&q, candidates.iter().map(|(i, c)| (i, c)), 0.8)
            .unwrap()
            .unwrap();
        assert_eq!(best.id, 2);
    }

    #[test]
    fn test_distance_metric() {
        let q = d(&[1.0, 0.0]);
        // cos 0.8 gives distance 0.2
        let candidates = [(1u32, d(&[0.8, 0.6])), (2u32, d(&[0.0, 1.0]))];
        let metric = MatchMetric::Distance { max_distance: 0.4 };
        let best = metric.find_best(&q, candidates.iter().map(|(i, c)| (i, c))).unwrap().unwrap();
        assert_eq!(best.id, 1);
        assert!((best.confidence() - 80.0).abs() < 1e-3);

        let strict = MatchMetric::Distance { max_distance: 0.1 };
        assert_eq!(strict.find_best(&q, candidates.iter().map(|(i, c)| (i, c))).unwrap(), None);
    }

    #[test]
    fn test_metric_serde_shape() {
        let json = serde_json::to_value(MatchMetric::default()).unwrap();
        assert_eq!(json["kind"], "cosine");
        assert_eq!(json["threshold"], 0.8f32 as f64);
    }

    fn two_tone(split: u32) -> Image {
        Image::from_fn(40, 40, |x, _| {
            if x < split {
                Rgb([20, 20, 20])
            } else {
                Rgb([220, 220, 220])
            }
        })
    }

    #[test]
    fn test_histogram_correlation() {
        let a = two_tone(20);
        assert!((histogram_correlation(&a, &a) - 1.0).abs() < 1e-6);
        let flat = Image::from_pixel(40, 40, Rgb([128, 128, 128]));
        assert!(histogram_correlation(&a, &flat) < 0.5);
    }

    #[test]
    fn test_histogram_tolerates_small_gray_shifts() {
        let a = two_tone(20);
        let shifted = Image::from_fn(40, 40, |x, _| {
            if x < 20 {
                Rgb([22, 22, 22])
            } else {
                Rgb([218, 218, 218])
            }
        });
        assert!(histogram_correlation(&a, &shifted) > 0.99);
    }

    #[test]
    fn test_find_best_image_match() {
        let query = two_tone(20);
        let stored = [
            ("same", two_tone(20)),
            ("flat", Image::from_pixel(40, 40, Rgb([128, 128, 128]))),
        ];
        let best = find_best_image_match(&query, stored.iter().map(|(i, c)| (i, c)), 0.5).unwrap();
        assert_eq!(best.id, "same");
        let flat_only = stored[1..].iter().map(|(i, c)| (i, c));
        assert!(find_best_image_match(&query, flat_only, 0.5).is_none());
    }
}
