//! Per-identity descriptor store interface.

use crate::types::{Descriptor, Image};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Descriptor,
    Image,
}

/// What an enrollment stores.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Descriptor(Descriptor),
    Image(Image),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Descriptor(_) => PayloadKind::Descriptor,
            Self::Image(_) => PayloadKind::Image,
        }
    }

    /// Descriptor length, or pixel count for images.
    pub fn dimensions(&self) -> usize {
        match self {
            Self::Descriptor(d) => d.dim(),
            Self::Image(img) => (img.width() * img.height()) as usize,
        }
    }
}

/// Metadata of one enrolled record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    #[serde(rename = "face_id")]
    pub record_id: Uuid,
    #[serde(rename = "user_id")]
    pub identity: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Payload file name, relative to the identity.
    pub filename: String,
    pub kind: PayloadKind,
    pub source_model: String,
    pub dimensions: usize,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
    #[error("store I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image encoding: {0}")]
    Image(#[from] image::ImageError),
}

/// Key-value style store of enrolled faces, grouped by identity.
///
/// Implementations are shared across threads; writes to one identity are
/// serialized, writes to different identities are not.
pub trait DescriptorStore: Send + Sync {
    fn enroll(
        &self,
        identity: &str,
        payload: &Payload,
        source_model: &str,
    ) -> Result<DescriptorRecord, StoreError>;

    /// Records of one identity, oldest first. Unknown identities are empty.
    fn list(&self, identity: &str) -> Result<Vec<DescriptorRecord>, StoreError>;

    /// Records of every identity.
    fn list_all(&self) -> Result<Vec<DescriptorRecord>, StoreError>;

    fn load(&self, record: &DescriptorRecord) -> Result<Payload, StoreError>;

    /// Returns `false` when the record did not exist.
    fn delete(&self, identity: &str, record_id: Uuid) -> Result<bool, StoreError>;

    /// Returns the number of records removed.
    fn delete_identity(&self, identity: &str) -> Result<usize, StoreError>;
}

/// Reject keys that cannot be a single directory name.
pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let invalid = identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("user-42.b").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(validate_identity(bad), Err(StoreError::InvalidIdentity(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_record_metadata_keys() {
        let record = DescriptorRecord {
            record_id: Uuid::new_v4(),
            identity: "alice".into(),
            created_at: Utc::now(),
            filename: "x.f32".into(),
            kind: PayloadKind::Descriptor,
            source_model: "w600k_r50".into(),
            dimensions: 512,
        };
        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "face_id",
            "user_id",
            "timestamp",
            "filename",
            "kind",
            "source_model",
            "dimensions",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["kind"], "descriptor");
        let back: DescriptorRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
