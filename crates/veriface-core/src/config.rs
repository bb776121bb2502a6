//! Engine tuning knobs. Every field has a default, so a partial TOML table
//! is enough to override one value.

use crate::decode::DEFAULT_MAX_IMAGE_BYTES;
use crate::matcher::{MatchMetric, DEFAULT_HISTOGRAM_THRESHOLD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub match_metric: MatchMetric,
    /// Match confidence (0–100) at which verification short-circuits.
    pub strong_match_confidence: f32,
    /// Histogram correlation needed to match a stored image record.
    pub histogram_threshold: f32,
    pub max_image_bytes: usize,
    pub max_video_frames: usize,
    /// Process every n-th frame.
    pub video_frame_interval: usize,
    pub video_min_success_rate: f32,
    pub video_min_confidence: f32,
    /// Margin around the face crop stored for image records.
    pub enroll_margin: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_metric: MatchMetric::default(),
            strong_match_confidence: 90.0,
            histogram_threshold: DEFAULT_HISTOGRAM_THRESHOLD,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_video_frames: 100,
            video_frame_interval: 1,
            video_min_success_rate: 0.7,
            video_min_confidence: 70.0,
            enroll_margin: 0.1,
        }
    }
}
