//! Frame-sequence verification.
//!
//! Frames are sampled, each one gets detection only, and the sequence
//! succeeds when enough frames show a confident face.

use crate::backend::SelectionPolicy;
use crate::decode::ImageInput;
use crate::engine::{Failure, TierDetection, VerificationEngine};
use crate::liveness::LivenessAssessment;
use crate::store::DescriptorStore;
use crate::types::{FailureKind, Image};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct VideoRequest {
    pub identity: Option<String>,
    pub save_on_success: bool,
    pub basic_only: bool,
    pub request_id: Option<String>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameOutcome {
    /// Position in the input sequence.
    pub index: usize,
    pub success: bool,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoVerificationResult {
    pub success: bool,
    /// Mean confidence of the successful frames.
    pub confidence: f32,
    pub frames_processed: usize,
    pub success_rate: f32,
    pub face_id: Option<Uuid>,
    pub message: String,
    pub request_id: Option<String>,
    pub error: Option<FailureKind>,
    pub frames: Vec<FrameOutcome>,
}

struct BestFrame {
    image: Image,
    found: TierDetection,
    confidence: f32,
}

impl<S: DescriptorStore + ?Sized> VerificationEngine<S> {
    /// Verify a sequence of frames.
    ///
    /// At most `max_video_frames` are processed, taking every
    /// `video_frame_interval`-th frame. Undecodable frames count as failures.
    pub fn verify_frames<I>(&mut self, frames: I, request: &VideoRequest) -> VideoVerificationResult
    where
        I: IntoIterator,
        I::Item: Into<ImageInput>,
    {
        let interval = self.config().video_frame_interval.max(1);
        let max_frames = self.config().max_video_frames;
        let policy = SelectionPolicy {
            has_identity: false,
            basic_only: request.basic_only,
        };

        let mut unavailable = HashSet::new();
        let mut outcomes = Vec::new();
        let mut best: Option<BestFrame> = None;
        let mut aborted: Option<Failure> = None;

        let sampled = frames
            .into_iter()
            .enumerate()
            .step_by(interval)
            .take(max_frames);
        for (index, frame) in sampled {
            let image = match self.decoder().decode_owned(frame.into()) {
                Ok(image) => image,
                Err(e) => {
                    tracing::debug!(index, error = %e, "frame decode failed");
                    outcomes.push(FrameOutcome {
                        index,
                        success: false,
                        confidence: 0.0,
                    });
                    continue;
                }
            };

            match self.detect(&image, policy, &mut unavailable, request.deadline) {
                Ok(found) => {
                    let confidence = LivenessAssessment::assess(&image, &found.detection.region)
                        .apply(found.detection.region.confidence);
                    outcomes.push(FrameOutcome {
                        index,
                        success: true,
                        confidence,
                    });
                    if best.as_ref().map_or(true, |b| confidence > b.confidence) {
                        best = Some(BestFrame {
                            image,
                            found,
                            confidence,
                        });
                    }
                }
                Err(failure) if failure.kind == FailureKind::BackendTimeout => {
                    aborted = Some(failure);
                    break;
                }
                Err(_) => outcomes.push(FrameOutcome {
                    index,
                    success: false,
                    confidence: 0.0,
                }),
            }
        }

        let mut result = self.aggregate(outcomes, request.request_id.clone());

        if let Some(failure) = aborted {
            result.success = false;
            result.message = failure.message;
            result.error = Some(failure.kind);
        } else if let (true, true, Some(identity), Some(best)) = (
            result.success,
            request.save_on_success,
            request.identity.as_deref(),
            best,
        ) {
            match self.enroll_detection(&best.image, &best.found, identity, request.deadline) {
                Ok(record) => {
                    tracing::info!(identity, record_id = %record.record_id, "best frame enrolled");
                    result.face_id = Some(record.record_id);
                }
                Err(failure) => {
                    result.success = false;
                    result.message = failure.message;
                    result.error = Some(failure.kind);
                }
            }
        }

        tracing::info!(
            request_id = ?result.request_id,
            frames = result.frames_processed,
            success_rate = result.success_rate,
            confidence = result.confidence,
            success = result.success,
            "video verification complete"
        );
        result
    }

    fn aggregate(
        &self,
        frames: Vec<FrameOutcome>,
        request_id: Option<String>,
    ) -> VideoVerificationResult {
        let processed = frames.len();
        let successes: Vec<f32> = frames
            .iter()
            .filter(|f| f.success)
            .map(|f| f.confidence)
            .collect();

        let success_rate = if processed > 0 {
            successes.len() as f32 / processed as f32
        } else {
            0.0
        };
        let confidence = if successes.is_empty() {
            0.0
        } else {
            successes.iter().sum::<f32>() / successes.len() as f32
        };

        let config = self.config();
        let success = success_rate > config.video_min_success_rate
            && confidence > config.video_min_confidence;
        let message = if processed == 0 {
            "No frames to analyze".to_string()
        } else {
            "Video analysis complete".to_string()
        };

        VideoVerificationResult {
            success,
            confidence,
            frames_processed: processed,
            success_rate,
            face_id: None,
            message,
            request_id,
            error: None,
            frames,
        }
    }
}
