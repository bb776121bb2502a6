//! veriface-core: face verification decision engine.
//!
//! Decodes an image, finds a face with the best available backend (SCRFD +
//! ArcFace, SCRFD + attribute models, or a classical skin-segmentation
//! detector), matches it against a per-identity descriptor store and fuses
//! the signals into one 0–100 confidence.

pub mod alignment;
pub mod attributes;
pub mod backend;
pub mod config;
pub mod decode;
pub mod detector;
pub mod engine;
pub mod liveness;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;
pub mod video;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

pub use backend::{BackendSet, BackendStatus, FaceBackend};
pub use config::EngineConfig;
pub use decode::{decode_image, DecodeError, ImageDecoder, ImageInput};
pub use engine::{VerificationEngine, VerifyOptions, VerifyRequest};
pub use matcher::{find_best_match, BestMatch, MatchError, MatchMetric};
pub use store::{DescriptorRecord, DescriptorStore, Payload, PayloadKind, StoreError};
pub use types::{
    BackendTier, Descriptor, FaceAttributes, FaceRegion, FailureKind, Image, VerificationResult,
};
pub use video::{VideoRequest, VideoVerificationResult};

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("veriface")
}

/// `$XDG_DATA_HOME/veriface/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/veriface/faces`.
pub fn default_store_dir() -> PathBuf {
    data_dir().join("faces")
}
